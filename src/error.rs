//! Error types for the telemetry and command subsystem
//!
//! Every failure class gets its own enum so callers can tell a broker outage
//! apart from a bad frame or a rejected publish.

use std::time::Duration;
use thiserror::Error;

/// Failure to establish the broker link
///
/// `Clone` because one connect outcome is handed to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Network level failure (DNS, refused socket, TLS, dropped stream)
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Broker answered the CONNECT but refused the session
    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    /// No CONNACK within the configured window
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// `disconnect()` was called while the attempt was still in flight
    #[error("Connect attempt aborted by disconnect")]
    Aborted,
}

/// Inbound payload that could not be turned into a sample or report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Payload carries neither a device id nor a device name")]
    MissingDevice,

    #[error("Unparseable timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Transport refused a subscribe or publish request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Outbound frame could not be emitted
#[derive(Debug, Error)]
pub enum PublishError {
    /// Publishing required a connection and connecting failed
    #[error("Not connected: {0}")]
    Connect(#[from] ConnectionError),

    /// Transport refused or lost the frame
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identity token unavailable at publish time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("No identity token available")]
    Absent,

    #[error("Token provider failed: {0}")]
    Provider(String),
}

/// Configuration file problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
