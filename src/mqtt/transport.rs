//! Broker transport seam
//!
//! [`Transport`] is everything the connection manager needs from an MQTT
//! client. [`RumqttTransport`] is the production implementation on top of
//! `rumqttc`; tests substitute a scripted fake.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use rumqttc::QoS;

use super::message_manager::InboundFrame;
use crate::config::BrokerConfig;
use crate::error::{ConfigError, ConnectionError, TransportError};

/// Notifications a live transport pushes to the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Publish received on a subscribed topic
    Frame(InboundFrame),
    /// A previously established link dropped; the transport retries on its own
    Lost(String),
    /// Background recovery is dialing the broker again
    Reconnecting,
    /// Background recovery succeeded
    Restored,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a session and resolves once the broker acknowledged it.
    ///
    /// Any earlier session is closed first. Events of the new session are
    /// pushed into `events` until it is closed.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), ConnectionError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Resolves when the broker acknowledged the frame (QoS 1/2) or it was
    /// written (QoS 0).
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>)
        -> Result<(), TransportError>;

    /// Closes the current session. No-op without one.
    async fn disconnect(&self);
}

type AckSender = oneshot::Sender<Result<(), TransportError>>;

/// Matches publish requests to their PUBACKs.
///
/// rumqttc assigns packet ids inside the event loop, in request order, so a
/// FIFO of waiters is paired with `Outgoing::Publish(pkid)` notifications.
#[derive(Default)]
struct AckTracker {
    queued: Mutex<VecDeque<AckSender>>,
    inflight: Mutex<HashMap<u16, AckSender>>,
}

impl AckTracker {
    fn enqueue(&self, waiter: AckSender) {
        lock(&self.queued).push_back(waiter);
    }

    fn dequeue_last(&self) {
        lock(&self.queued).pop_back();
    }

    fn assign(&self, pkid: u16) {
        let mut inflight = lock(&self.inflight);
        // Retransmissions after a reconnect reuse their pkid
        if inflight.contains_key(&pkid) {
            return;
        }
        let Some(waiter) = lock(&self.queued).pop_front() else {
            return;
        };
        if pkid == 0 {
            let _ = waiter.send(Ok(()));
        } else {
            inflight.insert(pkid, waiter);
        }
    }

    fn acknowledge(&self, pkid: u16) {
        if let Some(waiter) = lock(&self.inflight).remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_all(&self, reason: &str) {
        let queued: Vec<_> = lock(&self.queued).drain(..).collect();
        let inflight: Vec<_> = lock(&self.inflight).drain().map(|(_, w)| w).collect();
        for waiter in queued.into_iter().chain(inflight) {
            let _ = waiter.send(Err(TransportError(reason.to_string())));
        }
    }
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
    acks: Arc<AckTracker>,
}

/// rumqttc-backed transport
pub struct RumqttTransport {
    options: MqttOptions,
    capacity: usize,
    reconnect_interval: Duration,
    session: Mutex<Option<Session>>,
    publish_order: tokio::sync::Mutex<()>,
}

impl RumqttTransport {
    pub fn from_config(config: &BrokerConfig) -> Result<Self, ConfigError> {
        let (host, port) = config.host_port()?;
        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options
            .set_keep_alive(config.keep_alive().max(Duration::from_secs(5)))
            .set_clean_session(true);
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        debug!("MQTT options: {:?}", options);

        Ok(Self {
            options,
            capacity: config.channel_capacity,
            reconnect_interval: config.reconnect_interval(),
            session: Mutex::new(None),
            publish_order: tokio::sync::Mutex::new(()),
        })
    }

    fn close_session(&self) {
        if let Some(session) = lock(&self.session).take() {
            debug!("Closing MQTT session");
            session.cancel.cancel();
            session.acks.fail_all("session closed");
        }
    }

    fn live_session(&self) -> Result<(AsyncClient, Arc<AckTracker>), TransportError> {
        lock(&self.session)
            .as_ref()
            .map(|s| (s.client.clone(), s.acks.clone()))
            .ok_or_else(|| TransportError("no open session".to_string()))
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), ConnectionError> {
        self.close_session();

        let (client, eventloop) = AsyncClient::new(self.options.clone(), self.capacity);
        let cancel = CancellationToken::new();
        let acks = Arc::new(AckTracker::default());
        let (ready_tx, ready_rx) = oneshot::channel();

        info!(
            "Connecting to MQTT broker {}:{}",
            self.options.broker_address().0,
            self.options.broker_address().1
        );

        tokio::spawn(run_event_loop(
            eventloop,
            events,
            acks.clone(),
            cancel.clone(),
            ready_tx,
            self.reconnect_interval,
        ));

        *lock(&self.session) = Some(Session {
            client,
            cancel,
            acks,
        });

        ready_rx
            .await
            .unwrap_or_else(|_| Err(ConnectionError::Unreachable("event loop ended".to_string())))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let (client, _) = self.live_session()?;
        client
            .subscribe(topic, qos)
            .await
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let (client, acks) = self.live_session()?;
        let (ack_tx, ack_rx) = oneshot::channel();

        {
            let _order = self.publish_order.lock().await;
            acks.enqueue(ack_tx);
            if let Err(e) = client.publish(topic, qos, false, payload).await {
                acks.dequeue_last();
                return Err(TransportError(e.to_string()));
            }
        }

        ack_rx
            .await
            .unwrap_or_else(|_| Err(TransportError("publish abandoned".to_string())))
    }

    async fn disconnect(&self) {
        self.close_session();
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    acks: Arc<AckTracker>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), ConnectionError>>,
    reconnect_interval: Duration,
) {
    let mut ready = Some(ready);

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => match ready.take() {
                Some(ready) => {
                    info!("MQTT session established");
                    let _ = ready.send(Ok(()));
                }
                None => {
                    info!("MQTT session restored");
                    let _ = events.send(TransportEvent::Restored);
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let frame = InboundFrame::from_topic(publish.topic, publish.payload.to_vec());
                if events.send(TransportEvent::Frame(frame)).is_err() {
                    debug!("No listener for inbound frames");
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.acknowledge(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.assign(pkid),
            Ok(_) => {}
            Err(e) => {
                if let Some(ready) = ready.take() {
                    error!("MQTT connect failed: {}", e);
                    let _ = ready.send(Err(classify(&e)));
                    break;
                }

                warn!(
                    "MQTT link lost: {}, retrying in {:?}",
                    e, reconnect_interval
                );
                let _ = events.send(TransportEvent::Lost(e.to_string()));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_interval) => {}
                }
                let _ = events.send(TransportEvent::Reconnecting);
            }
        }
    }

    acks.fail_all("event loop stopped");
    debug!("MQTT event loop terminated");
}

fn classify(e: &rumqttc::ConnectionError) -> ConnectionError {
    match e {
        rumqttc::ConnectionError::ConnectionRefused(code) => {
            ConnectionError::Rejected(format!("{code:?}"))
        }
        other => ConnectionError::Unreachable(other.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
