//! # MQTT Integration Module
//!
//! Broker side of the console: one shared connection, topic dispatch, and
//! authenticated command publishing.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── message_manager.rs  - InboundFrame representation
//! ├── transport.rs        - Transport seam and the rumqttc implementation
//! ├── connection.rs       - Connection state machine, coalesced connect
//! ├── router.rs           - Topic -> handler dispatch
//! └── publisher.rs        - Token-stamped outbound commands
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! broker ──► Transport ──► ConnectionManager ──► SubscriptionRouter ──► handler
//! caller ──► OutboundPublisher ──► ConnectionManager::connect ──► Transport ──► broker
//! ```
//!
//! All I/O is async. Shared tables sit behind short-lived std locks that are
//! never held across an `.await`.

pub mod connection;
pub mod message_manager;
pub mod publisher;
pub mod router;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use message_manager::InboundFrame;
pub use publisher::{
    BackendVerdict, DispatchReport, EnvTokenProvider, FirmwareBackend, OutboundCommand,
    OutboundPublisher, TokenProvider,
};
pub use router::{FrameHandler, SubscriptionRouter};
pub use transport::{QoS, RumqttTransport, Transport, TransportEvent};

/// Topic layout under one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
        }
    }

    /// Inbound device telemetry
    pub fn monitoring(&self) -> String {
        format!("{}/Monitoring", self.namespace)
    }

    /// Firmware update reports sent by nodes after an OTA run
    pub fn update_log(&self) -> String {
        format!("{}/Log/Firmware_Update", self.namespace)
    }

    /// Outbound update command for one node
    pub fn firmware(&self, node_id: u64) -> String {
        format!("{}/Firmware/{}", self.namespace, node_id)
    }
}
