//! Watch notifications in, queue keys out.

#![forbid(unsafe_code)]

use std::sync::Arc;

use autolabel_core::{ResourceEventHandler, ResourceKey, ResourceSnapshot};
use autolabel_queue::WorkQueue;
use metrics::counter;
use tracing::trace;

use crate::sync::{ErrorSink, SyncError};

pub struct EventBridge {
    queue: Arc<WorkQueue<ResourceKey>>,
    sink: Arc<dyn ErrorSink>,
}

impl EventBridge {
    pub fn new(queue: Arc<WorkQueue<ResourceKey>>, sink: Arc<dyn ErrorSink>) -> Self {
        Self { queue, sink }
    }

    fn enqueue(&self, obj: &ResourceSnapshot) {
        match obj.key() {
            Ok(key) => self.queue.add(key),
            Err(e) => self.sink.report(None, &SyncError::from(e)),
        }
    }
}

impl ResourceEventHandler for EventBridge {
    fn on_add(&self, obj: &ResourceSnapshot) {
        self.enqueue(obj);
    }

    fn on_update(&self, old: &ResourceSnapshot, new: &ResourceSnapshot) {
        if old == new {
            trace!(name = %new.name(), "unchanged; skipping");
            counter!("bridge_updates_suppressed_total", 1u64);
            return;
        }
        self.enqueue(new);
    }
}
