//! # nodewatch
//!
//! Telemetry ingestion and firmware command publishing for a fleet of
//! sensor nodes behind an MQTT broker.
//!
//! - [`mqtt`]: broker connection lifecycle, topic dispatch, outbound commands
//! - [`telemetry`]: payload decoding and bounded per-device series
//! - [`service`]: wires both together behind one service object
//! - [`config`]: TOML configuration
//! - [`error`]: error taxonomy

pub mod config;
pub mod error;
pub mod mqtt;
pub mod service;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use service::TelemetryService;
