//! Outbound command publishing
//!
//! Every frame carries the caller's identity token under `_token` and goes
//! out at QoS 1. Publishing while disconnected connects first; a failed
//! connect fails the publish, nothing is dropped silently.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::connection::ConnectionManager;
use super::transport::QoS;
use super::Topics;
use crate::error::{PublishError, TokenError};

/// Frame key carrying the identity token
pub const TOKEN_FIELD: &str = "_token";

/// Source of the bearer token attached to outbound commands
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn current_token(&self) -> Result<String, TokenError>;
}

/// Reads the token from an environment variable on every call, so a token
/// refreshed by an external login helper is picked up without restart.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn current_token(&self) -> Result<String, TokenError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            Ok(_) | Err(std::env::VarError::NotPresent) => Err(TokenError::Absent),
            Err(e) => Err(TokenError::Provider(e.to_string())),
        }
    }
}

/// Answer of the firmware backend to a submitted command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendVerdict {
    Accepted,
    Rejected(String),
}

/// REST backend that records firmware updates
#[async_trait]
pub trait FirmwareBackend: Send + Sync + 'static {
    async fn submit_firmware_update(&self, command: &OutboundCommand) -> BackendVerdict;
}

/// Firmware update instruction for one node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCommand {
    pub node_id: u64,
    pub firmware_url: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Attached at publish time as `_token`
    #[serde(skip)]
    pub token: String,
}

/// Outcome of sending one command down both paths.
///
/// The backend record and the broker publish are independent; they can
/// disagree and nothing reconciles them.
#[derive(Debug)]
pub struct DispatchReport {
    pub command: OutboundCommand,
    /// `None` when no backend is configured
    pub backend: Option<BackendVerdict>,
    pub broker: Result<(), PublishError>,
}

impl DispatchReport {
    pub fn fully_delivered(&self) -> bool {
        self.broker.is_ok() && !matches!(self.backend, Some(BackendVerdict::Rejected(_)))
    }
}

pub struct OutboundPublisher {
    connection: ConnectionManager,
    tokens: Arc<dyn TokenProvider>,
    backend: Option<Arc<dyn FirmwareBackend>>,
    topics: Topics,
}

impl OutboundPublisher {
    pub fn new(
        connection: ConnectionManager,
        tokens: Arc<dyn TokenProvider>,
        backend: Option<Arc<dyn FirmwareBackend>>,
        topics: Topics,
    ) -> Self {
        Self {
            connection,
            tokens,
            backend,
            topics,
        }
    }

    /// Serializes `payload` plus `token` and publishes it at QoS 1.
    ///
    /// Resolves once the broker acknowledged the frame. A payload that is not
    /// a JSON object is wrapped as `{"payload": ...}`.
    pub async fn publish<P>(
        &self,
        topic: &str,
        payload: &P,
        token: &str,
    ) -> Result<(), PublishError>
    where
        P: Serialize + Sync + ?Sized,
    {
        let mut frame = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        frame.insert(TOKEN_FIELD.to_string(), Value::String(token.to_string()));
        let bytes = serde_json::to_vec(&frame)?;

        if !self.connection.is_connected() {
            debug!("Publish to {} needs a connection first", topic);
            self.connection.connect().await.map_err(|e| {
                error!("Publish to {} aborted, connect failed: {}", topic, e);
                PublishError::Connect(e)
            })?;
        }

        match self
            .connection
            .transport()
            .publish(topic, QoS::AtLeastOnce, bytes)
            .await
        {
            Ok(()) => {
                self.connection.record_sent();
                info!("Published to {}", topic);
                Ok(())
            }
            Err(e) => {
                error!("Publish to {} failed: {}", topic, e);
                Err(PublishError::Transport(e))
            }
        }
    }

    /// Builds the standard update command for `node_id`. A missing token does
    /// not block the command; it goes out with an empty token field.
    pub async fn build_firmware_command(
        &self,
        node_id: u64,
        firmware_url: impl Into<String>,
        version: impl Into<String>,
    ) -> OutboundCommand {
        let token = match self.tokens.current_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Sending firmware command without token: {}", e);
                String::new()
            }
        };

        OutboundCommand {
            node_id,
            firmware_url: firmware_url.into(),
            version: version.into(),
            timestamp: Utc::now(),
            token,
        }
    }

    pub async fn publish_command(&self, command: &OutboundCommand) -> Result<(), PublishError> {
        let topic = self.topics.firmware(command.node_id);
        self.publish(&topic, command, &command.token).await
    }

    /// Publishes a firmware update command to `<namespace>/Firmware/<node_id>`.
    pub async fn publish_firmware_update(
        &self,
        node_id: u64,
        firmware_url: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<(), PublishError> {
        let command = self
            .build_firmware_command(node_id, firmware_url, version)
            .await;
        self.publish_command(&command).await
    }

    /// Submits the command to the backend and publishes it to the broker
    /// concurrently, reporting both outcomes.
    pub async fn dispatch_firmware_update(
        &self,
        node_id: u64,
        firmware_url: impl Into<String>,
        version: impl Into<String>,
    ) -> DispatchReport {
        let command = self
            .build_firmware_command(node_id, firmware_url, version)
            .await;

        let backend = async {
            match &self.backend {
                Some(backend) => Some(backend.submit_firmware_update(&command).await),
                None => None,
            }
        };
        let (backend, broker) = tokio::join!(backend, self.publish_command(&command));

        if let Some(BackendVerdict::Rejected(reason)) = &backend {
            warn!(
                "Backend rejected firmware {} for node {}: {}",
                command.version, command.node_id, reason
            );
        }

        DispatchReport {
            command,
            backend,
            broker,
        }
    }
}
