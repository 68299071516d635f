//! # Telemetry Module
//!
//! Turns raw monitoring frames into typed samples and keeps a bounded,
//! time-ordered window of them per device.
//!
//! ```text
//! telemetry/
//! ├── decoder.rs       - JSON payload -> TelemetrySample / UpdateReport
//! ├── series.rs        - SeriesBuffer ring and the per-device SeriesStore
//! └── update_board.rs  - latest firmware update report per device
//! ```
//!
//! Nothing in here touches the network. The MQTT side hands frames in through
//! router handlers, the UI reads snapshots out.

pub mod decoder;
pub mod series;
pub mod update_board;

pub use decoder::{decode_sample, decode_update_report, DeviceId, TelemetrySample, UpdateReport};
pub use series::{SeriesBuffer, SeriesStore};
pub use update_board::UpdateBoard;

#[cfg(test)]
mod tests;
