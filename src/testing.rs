//! Scriptable fakes for the transport, token and backend seams

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::{ConnectionError, TokenError, TransportError};
use crate::mqtt::message_manager::InboundFrame;
use crate::mqtt::publisher::{BackendVerdict, FirmwareBackend, OutboundCommand, TokenProvider};
use crate::mqtt::transport::{QoS, Transport, TransportEvent};

pub struct FakeTransport {
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    outcomes: Mutex<VecDeque<Result<(), ConnectionError>>>,
    gate: watch::Sender<bool>,
    disconnect_gate: watch::Sender<bool>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    connected: Mutex<bool>,
    subscribes: Mutex<Vec<(String, QoS)>>,
    publishes: Mutex<Vec<(String, QoS, Vec<u8>)>>,
    publish_failure: Mutex<Option<TransportError>>,
}

impl FakeTransport {
    /// Connects succeed immediately
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        let (disconnect_gate, _) = watch::channel(true);
        Self {
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            outcomes: Mutex::new(VecDeque::new()),
            gate,
            disconnect_gate,
            events: Mutex::new(None),
            connected: Mutex::new(false),
            subscribes: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
            publish_failure: Mutex::new(None),
        }
    }

    /// Connects block until [`FakeTransport::open_gate`] is called
    pub fn gated() -> Self {
        let fake = Self::new();
        fake.gate.send_replace(false);
        fake
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    /// Disconnects block until [`FakeTransport::release_disconnects`] is called
    pub fn hold_disconnects(&self) {
        self.disconnect_gate.send_replace(false);
    }

    pub fn release_disconnects(&self) {
        self.disconnect_gate.send_replace(true);
    }

    /// Queues the outcome of the next connect; unscripted connects succeed
    pub fn script_connect(&self, outcome: Result<(), ConnectionError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn fail_publishes(&self, reason: &str) {
        *self.publish_failure.lock().unwrap() = Some(TransportError(reason.to_string()));
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> Vec<(String, QoS)> {
        self.subscribes.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<(String, QoS, Vec<u8>)> {
        self.publishes.lock().unwrap().clone()
    }

    /// Pushes an event into the live session. Returns false without one.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        self.emit(TransportEvent::Frame(InboundFrame::from_topic(
            topic,
            payload.to_vec(),
        )))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), ConnectionError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(ConnectionError::Aborted);
        }

        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            *self.events.lock().unwrap() = Some(events);
            *self.connected.lock().unwrap() = true;
        }
        outcome
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError("not connected".to_string()));
        }
        self.subscribes.lock().unwrap().push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if let Some(failure) = self.publish_failure.lock().unwrap().clone() {
            return Err(failure);
        }
        if !*self.connected.lock().unwrap() {
            return Err(TransportError("not connected".to_string()));
        }
        self.publishes
            .lock()
            .unwrap()
            .push((topic.to_string(), qos, payload));
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.disconnect_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        *self.connected.lock().unwrap() = false;
        self.events.lock().unwrap().take();
    }
}

pub struct StaticTokens(pub Result<String, TokenError>);

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn current_token(&self) -> Result<String, TokenError> {
        self.0.clone()
    }
}

pub struct RecordingBackend {
    verdict: BackendVerdict,
    pub commands: Mutex<Vec<OutboundCommand>>,
}

impl RecordingBackend {
    pub fn new(verdict: BackendVerdict) -> Self {
        Self {
            verdict,
            commands: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FirmwareBackend for RecordingBackend {
    async fn submit_firmware_update(&self, command: &OutboundCommand) -> BackendVerdict {
        self.commands.lock().unwrap().push(command.clone());
        self.verdict.clone()
    }
}

/// Polls `condition` until it holds or a second has passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
