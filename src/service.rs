//! Telemetry service
//!
//! Explicit service object replacing a process-wide singleton: built from a
//! [`Config`] plus injected transport, token provider and optional backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::{Config, TelemetryConfig};
use crate::error::{ConnectionError, DecodeError, TransportError};
use crate::mqtt::{
    ConnectionManager, FirmwareBackend, FrameHandler, InboundFrame, OutboundPublisher,
    SubscriptionRouter, TokenProvider, Topics, Transport,
};
use crate::telemetry::{decode_sample, decode_update_report, SeriesStore, UpdateBoard};

/// Decode outcome counters
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    last_error: Mutex<Option<DecodeError>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub last_error: Option<DecodeError>,
}

impl IngestStats {
    fn accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn reject(&self, topic: &str, e: DecodeError) {
        warn!("Dropped frame on {}: {}", topic, e);
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(e);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}

pub struct TelemetryService {
    settings: TelemetryConfig,
    topics: Topics,
    connection: ConnectionManager,
    publisher: OutboundPublisher,
    series: Arc<SeriesStore>,
    updates: Arc<UpdateBoard>,
    stats: Arc<IngestStats>,
}

impl TelemetryService {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
        backend: Option<Arc<dyn FirmwareBackend>>,
    ) -> Self {
        let topics = Topics::new(config.telemetry.namespace.clone());
        let connection = ConnectionManager::new(
            transport,
            Arc::new(SubscriptionRouter::new()),
            config.broker.connect_timeout(),
        );
        let publisher =
            OutboundPublisher::new(connection.clone(), tokens, backend, topics.clone());

        Self {
            settings: config.telemetry.clone(),
            topics,
            connection,
            publisher,
            series: Arc::new(SeriesStore::new(config.telemetry.series_capacity)),
            updates: Arc::new(UpdateBoard::new()),
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Binds the ingest handlers and connects.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        if let Err(e) = self.register_handlers().await {
            warn!("Subscribing ingest topics failed: {}", e);
        }
        self.connection.connect().await
    }

    /// Disconnects. Series and update reports are kept.
    pub async fn stop(&self) {
        self.connection.disconnect().await;
    }

    /// (Re)binds the monitoring and, if enabled, update-log topics.
    pub async fn register_handlers(&self) -> Result<(), TransportError> {
        self.connection
            .subscribe(self.topics.monitoring(), self.monitoring_handler())
            .await?;

        if self.settings.update_log_enabled {
            self.connection
                .subscribe(self.topics.update_log(), self.update_log_handler())
                .await?;
        }

        info!("Ingest handlers registered under {}", self.topics.monitoring());
        Ok(())
    }

    fn monitoring_handler(&self) -> FrameHandler {
        let series = self.series.clone();
        let stats = self.stats.clone();
        Arc::new(move |frame: &InboundFrame| {
            match decode_sample(frame.payload(), frame.received_at()) {
                Ok(sample) => {
                    debug!("Sample from {}", sample.device());
                    series.append(sample);
                    stats.accept();
                }
                Err(e) => stats.reject(frame.topic(), e),
            }
        })
    }

    fn update_log_handler(&self) -> FrameHandler {
        let updates = self.updates.clone();
        let stats = self.stats.clone();
        Arc::new(move |frame: &InboundFrame| {
            match decode_update_report(frame.payload(), frame.received_at()) {
                Ok(report) => {
                    updates.record(report);
                    stats.accept();
                }
                Err(e) => stats.reject(frame.topic(), e),
            }
        })
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn publisher(&self) -> &OutboundPublisher {
        &self.publisher
    }

    pub fn series(&self) -> &Arc<SeriesStore> {
        &self.series
    }

    pub fn updates(&self) -> &Arc<UpdateBoard> {
        &self.updates
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn ingest_stats(&self) -> IngestSnapshot {
        self.stats.snapshot()
    }
}
