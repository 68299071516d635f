use chrono::{DateTime, Utc};
use std::fmt;

/// One frame as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    topic: String,
    payload: Vec<u8>,
    received_at: DateTime<Utc>,
}

impl fmt::Display for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(40).collect();
        write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
    }
}

impl InboundFrame {
    /// Stamps the frame with the current time
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::received(topic, payload, Utc::now())
    }

    pub fn received(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        received_at: DateTime<Utc>,
    ) -> Self {
        InboundFrame {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
