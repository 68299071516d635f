//! Broker connection lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Connected
//!      ▲                          │                 │
//!      └────────── error ─────────┘        link lost│
//!      ▲                                            ▼
//!      │                        Connecting ◄── Disconnected (transport backoff)
//!      │
//!      └── Disconnecting ◄── disconnect()
//! ```
//!
//! Concurrent `connect()` calls share one attempt: the first caller spawns
//! it, later callers wait on the same outcome channel. The attempt runs in
//! its own task, so a caller giving up never cancels it for the others.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::router::{FrameHandler, SubscriptionRouter};
use super::transport::{QoS, Transport, TransportEvent};
use crate::error::{ConnectionError, TransportError};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Observable link status for status displays
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<ConnectionError>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

type Outcome = Option<Result<(), ConnectionError>>;

struct Link {
    state: ConnectionState,
    last_error: Option<ConnectionError>,
    /// Outcome channel of the attempt in flight
    pending: Option<watch::Sender<Outcome>>,
    /// Bumped by every new attempt and every disconnect; stale tasks compare against it
    generation: u64,
    /// A transport session exists, possibly recovering in the background
    session_open: bool,
}

struct Shared {
    transport: Arc<dyn Transport>,
    router: Arc<SubscriptionRouter>,
    connect_timeout: Duration,
    link: Mutex<Link>,
    status: watch::Sender<ConnectionStatus>,
}

/// Owns the single logical broker link. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        router: Arc<SubscriptionRouter>,
        connect_timeout: Duration,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            shared: Arc::new(Shared {
                transport,
                router,
                connect_timeout,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    last_error: None,
                    pending: None,
                    generation: 0,
                    session_open: false,
                }),
                status,
            }),
        }
    }

    /// Connects, or joins the attempt already in flight.
    ///
    /// Every caller waiting on the same attempt receives the same outcome.
    /// A failed attempt is not retried here; call again to retry.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut outcome = {
            let mut link = self.link();
            if link.state == ConnectionState::Connected {
                return Ok(());
            }
            let joined = match link.state {
                ConnectionState::Connecting => link.pending.as_ref().map(watch::Sender::subscribe),
                _ => None,
            };
            match joined {
                Some(outcome) => {
                    debug!("Joining connect attempt already in flight");
                    outcome
                }
                None => self.start_attempt(&mut link),
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(ConnectionError::Aborted))
    }

    /// Closes the transport and drops every handler binding. Buffers owned
    /// elsewhere are untouched. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let (pending, generation) = {
            let mut link = self.link();
            if link.state == ConnectionState::Disconnected
                && link.pending.is_none()
                && !link.session_open
            {
                debug!("Disconnect requested while already disconnected");
                return;
            }
            link.state = ConnectionState::Disconnecting;
            link.generation += 1;
            link.session_open = false;
            (link.pending.take(), link.generation)
        };
        self.report_state(ConnectionState::Disconnecting, None);

        self.shared.transport.disconnect().await;

        if let Some(pending) = pending {
            let _ = pending.send(Some(Err(ConnectionError::Aborted)));
        }

        // A connect issued while the transport was closing owns the link now
        let finished = {
            let mut link = self.link();
            if link.generation == generation {
                link.state = ConnectionState::Disconnected;
                self.shared.router.clear();
                true
            } else {
                false
            }
        };
        if !finished {
            debug!("Connect attempt started during disconnect; leaving its state alone");
            return;
        }

        self.report_state(ConnectionState::Disconnected, None);
        info!("Disconnected from broker");
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.link().last_error.clone()
    }

    /// Receives every state transition and counter update
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.shared.router
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Binds `handler` to `topic`. Subscribes on the broker right away when
    /// connected, otherwise the binding is applied on the next connect.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: FrameHandler,
    ) -> Result<(), TransportError> {
        let topic = topic.into();
        self.shared.router.subscribe(topic.clone(), handler);

        if self.is_connected() {
            self.shared
                .transport
                .subscribe(&topic, QoS::AtLeastOnce)
                .await?;
            info!("Subscribed to {}", topic);
        } else {
            debug!("Deferred subscription to {} until connected", topic);
        }
        Ok(())
    }

    pub(crate) fn record_sent(&self) {
        self.shared.status.send_modify(|status| {
            status.messages_sent += 1;
            status.last_activity = Some(Utc::now());
        });
    }

    fn start_attempt(&self, link: &mut Link) -> watch::Receiver<Outcome> {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        link.state = ConnectionState::Connecting;
        link.pending = Some(outcome_tx);
        link.generation += 1;
        let generation = link.generation;

        self.report_state(ConnectionState::Connecting, None);
        info!("Starting connect attempt #{}", generation);

        let this = self.clone();
        tokio::spawn(async move { this.run_attempt(generation).await });

        outcome_rx
    }

    async fn run_attempt(self, generation: u64) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().pump(events_rx, generation));

        let attempt = tokio::time::timeout(
            self.shared.connect_timeout,
            self.shared.transport.connect(events_tx),
        )
        .await;

        let result = match attempt {
            Ok(result) => result,
            Err(_) => {
                self.shared.transport.disconnect().await;
                Err(ConnectionError::Timeout(self.shared.connect_timeout))
            }
        };

        // Final state and outcome sender change under one lock
        let pending = {
            let mut link = self.link();
            if link.generation != generation {
                debug!("Connect attempt #{} superseded", generation);
                return;
            }
            match &result {
                Ok(()) => {
                    link.state = ConnectionState::Connected;
                    link.last_error = None;
                    link.session_open = true;
                }
                Err(e) => {
                    link.state = ConnectionState::Disconnected;
                    link.last_error = Some(e.clone());
                    link.session_open = false;
                }
            }
            link.pending.take()
        };

        match &result {
            Ok(()) => {
                info!("Connected to broker");
                self.report_state(ConnectionState::Connected, None);
                self.resubscribe().await;
            }
            Err(e) => {
                error!("Connect attempt #{} failed: {}", generation, e);
                self.report_state(ConnectionState::Disconnected, Some(e.clone()));
            }
        }

        if let Some(pending) = pending {
            let _ = pending.send(Some(result));
        }
    }

    async fn pump(self, mut events: mpsc::UnboundedReceiver<TransportEvent>, generation: u64) {
        while let Some(event) = events.recv().await {
            if self.link().generation != generation {
                debug!("Dropping events of stale session #{}", generation);
                break;
            }

            match event {
                TransportEvent::Frame(frame) => {
                    self.shared.status.send_modify(|status| {
                        status.messages_received += 1;
                        status.last_activity = Some(frame.received_at());
                    });
                    self.shared.router.dispatch(&frame);
                }
                TransportEvent::Lost(reason) => {
                    let e = ConnectionError::Unreachable(reason);
                    warn!("Broker link lost: {}", e);
                    {
                        let mut link = self.link();
                        link.state = ConnectionState::Disconnected;
                        link.last_error = Some(e.clone());
                    }
                    self.report_state(ConnectionState::Disconnected, Some(e));
                }
                TransportEvent::Reconnecting => {
                    self.link().state = ConnectionState::Connecting;
                    self.report_state(ConnectionState::Connecting, None);
                }
                TransportEvent::Restored => {
                    {
                        let mut link = self.link();
                        link.state = ConnectionState::Connected;
                        link.last_error = None;
                    }
                    info!("Broker link restored");
                    self.report_state(ConnectionState::Connected, None);
                    self.resubscribe().await;
                }
            }
        }
        debug!("Event pump for session #{} finished", generation);
    }

    async fn resubscribe(&self) {
        for topic in self.shared.router.topics() {
            match self
                .shared
                .transport
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
            {
                Ok(()) => info!("Subscribed to {}", topic),
                Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
            }
        }
    }

    fn report_state(&self, state: ConnectionState, error: Option<ConnectionError>) {
        debug!("Connection state -> {:?}", state);
        self.shared.status.send_modify(|status| {
            status.connection_state = state;
            if error.is_some() {
                status.last_error = error;
            } else if state == ConnectionState::Connected {
                status.last_error = None;
            }
        });
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.shared
            .link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
