//! Bounded per-device sample windows
//!
//! Each device gets a [`SeriesBuffer`] on its first sample. Buffers are ring
//! buffers: appending to a full one evicts the sample that arrived first.
//! Samples sharing a timestamp are all kept, in arrival order.

use super::decoder::TelemetrySample;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Samples kept per device unless configured otherwise
pub const DEFAULT_CAPACITY: usize = 100;

/// Fixed-capacity FIFO of samples for one device
#[derive(Debug, Clone)]
pub struct SeriesBuffer {
    samples: VecDeque<TelemetrySample>,
    capacity: usize,
}

impl SeriesBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends in O(1). Returns the evicted sample when the buffer was full.
    pub fn push(&mut self, sample: TelemetrySample) -> Option<TelemetrySample> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    /// Contents in ascending timestamp order. The sort is stable, so equal
    /// timestamps stay in arrival order.
    pub fn snapshot(&self) -> Vec<TelemetrySample> {
        let mut out: Vec<TelemetrySample> = self.samples.iter().cloned().collect();
        out.sort_by_key(TelemetrySample::timestamp);
        out
    }

    /// Most recently arrived sample
    pub fn latest(&self) -> Option<&TelemetrySample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// All device buffers, shared between the ingest path and readers
#[derive(Debug)]
pub struct SeriesStore {
    buffers: RwLock<HashMap<String, SeriesBuffer>>,
    capacity: usize,
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SeriesStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Inserts `sample` into its device buffer, creating the buffer on first sight.
    pub fn append(&self, sample: TelemetrySample) {
        let mut buffers = match self.buffers.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Series store lock poisoned, recovering");
                poisoned.into_inner()
            }
        };

        let name = sample.device_name().to_string();
        let buffer = buffers.entry(name.clone()).or_insert_with(|| {
            debug!("New device observed: {}", name);
            SeriesBuffer::new(self.capacity)
        });

        if let Some(evicted) = buffer.push(sample) {
            debug!(
                "Evicted sample of {} stamped {}",
                name,
                evicted.timestamp()
            );
        }
    }

    /// Ascending-timestamp copy of one device's window; empty for unknown devices.
    pub fn snapshot(&self, device_name: &str) -> Vec<TelemetrySample> {
        self.read(|buffers| {
            buffers
                .get(device_name)
                .map(SeriesBuffer::snapshot)
                .unwrap_or_default()
        })
    }

    pub fn known_devices(&self) -> HashSet<String> {
        self.read(|buffers| buffers.keys().cloned().collect())
    }

    pub fn latest(&self, device_name: &str) -> Option<TelemetrySample> {
        self.read(|buffers| {
            buffers
                .get(device_name)
                .and_then(SeriesBuffer::latest)
                .cloned()
        })
    }

    pub fn len(&self, device_name: &str) -> usize {
        self.read(|buffers| buffers.get(device_name).map_or(0, SeriesBuffer::len))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<String, SeriesBuffer>) -> R) -> R {
        match self.buffers.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}
