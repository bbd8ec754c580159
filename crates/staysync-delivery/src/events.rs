//! Pipeline outcome events for decoupled observers.
//!
//! The pipeline emits one [`PipelineEvent`] per reservation it finishes.
//! Observers (statistics, audit, tests) implement [`EventHandler`] and are
//! combined with [`MulticastEventHandler`]; they never influence
//! forwarding.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use staysync_core::models::DispatchResult;

/// Where a reservation entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Pushed by the upstream webhook.
    Webhook,
    /// Found by the continuous poll tier.
    ContinuousPoll,
    /// Found by the deep-check tier.
    DeepCheck,
    /// Manual re-dispatch.
    Manual,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Webhook => write!(f, "webhook"),
            Self::ContinuousPoll => write!(f, "continuous_poll"),
            Self::DeepCheck => write!(f, "deep_check"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Events emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Reservation was already processed.
    Skipped {
        /// Primary identifier, if any.
        reservation_id: Option<String>,
        /// Entry point.
        origin: Origin,
        /// When the decision was made.
        at: DateTime<Utc>,
    },

    /// Reservation was fanned out.
    Dispatched {
        /// Aggregate result.
        result: DispatchResult,
        /// Entry point.
        origin: Origin,
        /// When dispatch finished.
        at: DateTime<Utc>,
    },
}

/// Receives pipeline events.
///
/// Handlers must not fail or block forwarding; errors are logged inside the
/// handler.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one event.
    async fn handle_event(&self, event: PipelineEvent);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: PipelineEvent) {}
}

/// Forwards events to every subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: PipelineEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct Counting {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for Counting {
        async fn handle_event(&self, _event: PipelineEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn skipped() -> PipelineEvent {
        PipelineEvent::Skipped {
            reservation_id: Some("r1".into()),
            origin: Origin::ContinuousPoll,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn multicast_forwards_to_all_subscribers() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(first.clone());
        multicast.add_subscriber(second.clone());

        multicast.handle_event(skipped()).await;

        assert_eq!(multicast.subscriber_count(), 2);
        assert_eq!(first.count.load(Ordering::SeqCst), 1);
        assert_eq!(second.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_multicast_and_no_op_accept_events() {
        MulticastEventHandler::new().handle_event(skipped()).await;
        NoOpEventHandler.handle_event(skipped()).await;
    }

    #[test]
    fn origin_display_is_snake_case() {
        assert_eq!(Origin::DeepCheck.to_string(), "deep_check");
        assert_eq!(serde_json::to_value(Origin::Webhook).unwrap(), "webhook");
    }
}
