//! Payload decoding for the monitoring and update-log topics

use crate::error::DecodeError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

const ID_KEYS: [&str; 2] = ["nodeId", "node_id"];
const NAME_KEYS: [&str; 2] = ["nodeName", "node_name"];
const LOCATION_KEYS: [&str; 2] = ["nodeLocation", "node_location"];
const TIMESTAMP_KEY: &str = "timestamp";
const NESTED_METRICS_KEY: &str = "data";

/// Identity of a sensor node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId {
    /// Numeric id, if the node reported one
    pub id: Option<u64>,
    /// Human-readable name; series are keyed by this
    pub name: String,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} (#{})", self.name, id),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One decoded device reading. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    device: DeviceId,
    location: Option<String>,
    metrics: BTreeMap<String, f64>,
    timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn new(
        device: DeviceId,
        metrics: BTreeMap<String, f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device,
            location: None,
            metrics,
            timestamp,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Sparse metric map; a metric the node did not report is simply absent
    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Firmware update report published by a node after an OTA run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub node_name: String,
    pub node_location: String,
    pub active: bool,
    pub first_version: String,
    pub latest_version: String,
    pub received_at: DateTime<Utc>,
}

/// Decodes one monitoring frame.
///
/// Accepts camelCase and snake_case identity keys. Every other numeric field,
/// top level or nested under `data`, becomes a metric. Without a timestamp, or
/// with an empty one, the sample is stamped with `received_at`.
pub fn decode_sample(
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<TelemetrySample, DecodeError> {
    let object = parse_object(payload)?;

    let id = first_of(&object, &ID_KEYS).and_then(as_device_id);
    let name = first_of(&object, &NAME_KEYS)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    let device = match (id, name) {
        (id, Some(name)) => DeviceId { id, name },
        (Some(id), None) => DeviceId {
            id: Some(id),
            name: format!("node-{id}"),
        },
        (None, None) => return Err(DecodeError::MissingDevice),
    };

    let timestamp = match object.get(TIMESTAMP_KEY) {
        None | Some(Value::Null) => received_at,
        Some(Value::String(raw)) if raw.trim().is_empty() => received_at,
        Some(Value::String(raw)) => parse_timestamp(raw)?,
        Some(other) => return Err(DecodeError::InvalidTimestamp(other.to_string())),
    };

    let mut metrics = BTreeMap::new();
    collect_metrics(&object, &mut metrics);
    if let Some(Value::Object(nested)) = object.get(NESTED_METRICS_KEY) {
        collect_metrics(nested, &mut metrics);
    }

    let sample = TelemetrySample::new(device, metrics, timestamp);
    Ok(
        match first_of(&object, &LOCATION_KEYS).and_then(Value::as_str) {
            Some(location) => sample.with_location(location),
            None => sample,
        },
    )
}

/// Decodes one firmware update report. All five report keys are required.
pub fn decode_update_report(
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<UpdateReport, DecodeError> {
    let object = parse_object(payload)?;

    let field = |key: &'static str| -> Result<String, DecodeError> {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(DecodeError::MissingField(key))
    };

    Ok(UpdateReport {
        node_name: field("node_name")?,
        node_location: field("node_location")?,
        active: field("node_status")? == "active",
        first_version: field("first_version")?,
        latest_version: field("latest_version")?,
        received_at,
    })
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(DecodeError::NotAnObject),
        Err(e) => Err(DecodeError::InvalidJson(e.to_string())),
    }
}

fn first_of<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

fn as_device_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            // Some firmware serialises ids as floats; accept integral ones
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_reserved(key: &str) -> bool {
    ID_KEYS.contains(&key)
        || NAME_KEYS.contains(&key)
        || LOCATION_KEYS.contains(&key)
        || key == TIMESTAMP_KEY
        || key == NESTED_METRICS_KEY
}

fn collect_metrics(object: &Map<String, Value>, metrics: &mut BTreeMap<String, f64>) {
    for (key, value) in object {
        if is_reserved(key) {
            continue;
        }
        if let Some(reading) = value.as_f64() {
            metrics.insert(key.clone(), reading);
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Nodes without an RTC zone send naive local-less stamps; treat as UTC
    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::InvalidTimestamp(raw.to_string()))
}
