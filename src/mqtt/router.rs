//! Topic -> handler dispatch table
//!
//! One handler per exact topic. Binding a topic again replaces its handler, so
//! reconnects never accumulate duplicates. Frames for unbound topics are
//! dropped without complaint.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace, warn};

use super::message_manager::InboundFrame;

/// Callback invoked with every frame on its topic
pub type FrameHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

#[derive(Default)]
pub struct SubscriptionRouter {
    handlers: RwLock<HashMap<String, FrameHandler>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the binding. Returns `true` if an earlier handler was replaced.
    pub fn subscribe(&self, topic: impl Into<String>, handler: FrameHandler) -> bool {
        let topic = topic.into();
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let replaced = handlers.insert(topic.clone(), handler).is_some();
        if replaced {
            debug!("Replaced handler for {}", topic);
        } else {
            debug!("Bound handler for {}", topic);
        }
        replaced
    }

    /// Runs the handler bound to the frame's exact topic.
    /// Returns whether a handler was found.
    pub fn dispatch(&self, frame: &InboundFrame) -> bool {
        // Clone the handler out so it runs without the table locked
        let handler = match self.handlers.read() {
            Ok(guard) => guard.get(frame.topic()).cloned(),
            Err(poisoned) => poisoned.into_inner().get(frame.topic()).cloned(),
        };

        match handler {
            Some(handler) => {
                handler(frame);
                true
            }
            None => {
                trace!("No handler for {}", frame.topic());
                false
            }
        }
    }

    /// Bound topics, in no particular order
    pub fn topics(&self) -> Vec<String> {
        match self.handlers.read() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }

    pub fn is_bound(&self, topic: &str) -> bool {
        match self.handlers.read() {
            Ok(guard) => guard.contains_key(topic),
            Err(poisoned) => poisoned.into_inner().contains_key(topic),
        }
    }

    pub fn clear(&self) {
        match self.handlers.write() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => {
                warn!("Router lock poisoned while clearing");
                poisoned.into_inner().clear()
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.handlers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
