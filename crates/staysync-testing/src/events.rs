//! Event handler that keeps every pipeline event for assertions.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use staysync_delivery::events::{EventHandler, PipelineEvent};

/// Records pipeline events in arrival order.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventHandler {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Number of `Dispatched` events.
    pub fn dispatched(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, PipelineEvent::Dispatched { .. })).count()
    }

    /// Number of `Skipped` events.
    pub fn skipped(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, PipelineEvent::Skipped { .. })).count()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: PipelineEvent) {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(event);
    }
}
