//! Explicit per-reservation processing pipeline.
//!
//! Stages run in registration order over a shared [`PipelineContext`]. The
//! standard pipeline is:
//!
//! ```text
//! DedupStage ──▶ DispatchStage ──▶ RetryEnqueueStage ──▶ MarkProcessedStage
//!     │
//!     └── duplicate or in flight ──▶ SKIPPED
//! ```
//!
//! Retries are stored before the reservation is marked processed, so a
//! failed enqueue leaves it eligible for the next sighting instead of
//! silently dropping the failed integrations.
//!
//! A stage can stop the run (a duplicate stops after dedup). A stage error
//! ends that reservation's run and is returned to the caller; other
//! reservations are unaffected. The dedup claim is released when the run
//! ends either way.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use staysync_core::{
    models::{DispatchResult, DispatchStatus, Reservation},
    Clock,
};

use crate::{
    dedup::{Admission, DedupClaim, DedupStore},
    dispatcher::{DispatchOutcome, Dispatcher},
    error::Result,
    events::{EventHandler, NoOpEventHandler, Origin, PipelineEvent},
    retry::RetryQueue,
};

/// A reservation entering the pipeline.
#[derive(Debug, Clone)]
pub struct ReservationEvent {
    /// Raw reservation.
    pub reservation: Reservation,
    /// Entry point.
    pub origin: Origin,
    /// Dispatch even if already processed.
    pub force: bool,
}

impl ReservationEvent {
    /// Creates an event subject to deduplication.
    pub fn new(reservation: Reservation, origin: Origin) -> Self {
        Self { reservation, origin, force: false }
    }

    /// Creates a manual re-dispatch that bypasses deduplication.
    pub fn forced(reservation: Reservation) -> Self {
        Self { reservation, origin: Origin::Manual, force: true }
    }
}

/// Lifecycle position of one reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "status")]
pub enum ReservationStage {
    /// Received, not yet checked.
    Discovered,
    /// Checked against the dedup store and new.
    DedupChecked,
    /// Already processed; nothing sent.
    Skipped,
    /// Fan-out in progress.
    Dispatching,
    /// Fan-out finished.
    Dispatched(DispatchStatus),
}

impl ReservationStage {
    /// Returns true if `next` is a legal successor.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Discovered, Self::DedupChecked | Self::Skipped)
                | (Self::DedupChecked, Self::Skipped | Self::Dispatching)
                | (Self::Dispatching, Self::Dispatched(_))
        )
    }
}

/// Mutable state shared by the stages of one run.
#[derive(Debug)]
pub struct PipelineContext {
    /// The input event.
    pub event: ReservationEvent,
    /// Primary identifier once extracted.
    pub reservation_id: Option<String>,
    /// Current lifecycle position.
    pub stage: ReservationStage,
    /// Fan-out result once dispatched.
    pub outcome: Option<DispatchOutcome>,
    /// Retries stored by the enqueue stage.
    pub retries_enqueued: usize,
    /// In-flight claim taken by the dedup stage.
    pub claim: Option<DedupClaim>,
}

impl PipelineContext {
    fn new(event: ReservationEvent) -> Self {
        Self {
            event,
            reservation_id: None,
            stage: ReservationStage::Discovered,
            outcome: None,
            retries_enqueued: 0,
            claim: None,
        }
    }

    /// Moves to `next`, logging illegal transitions.
    pub fn advance(&mut self, next: ReservationStage) {
        if !self.stage.can_transition_to(next) {
            tracing::warn!(from = ?self.stage, to = ?next, "unexpected reservation stage transition");
        }
        self.stage = next;
    }
}

/// Whether the run continues after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    /// Run the next stage.
    Continue,
    /// End the run successfully.
    Stop,
}

/// One pipeline step.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Processes the context.
    async fn process(&self, ctx: &mut PipelineContext) -> Result<StageFlow>;
}

/// Final state of one run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Primary identifier, if any.
    pub reservation_id: Option<String>,
    /// Where the run ended.
    pub stage: ReservationStage,
    /// Fan-out result when dispatched.
    pub result: Option<DispatchResult>,
}

impl PipelineReport {
    /// True if the reservation was skipped as a duplicate.
    pub fn skipped(&self) -> bool {
        self.stage == ReservationStage::Skipped
    }
}

/// Ordered list of stages.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Pipeline").field("stages", &names).finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { stages: Vec::new(), events: Arc::new(NoOpEventHandler), clock }
    }

    /// Creates the standard dedup, dispatch, enqueue, mark pipeline.
    pub fn standard(
        dedup: DedupStore,
        dispatcher: Dispatcher,
        retry_queue: RetryQueue,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut pipeline = Self::new(clock);
        pipeline.register(Arc::new(DedupStage::new(dedup.clone())));
        pipeline.register(Arc::new(DispatchStage::new(dispatcher)));
        pipeline.register(Arc::new(RetryEnqueueStage::new(retry_queue)));
        pipeline.register(Arc::new(MarkProcessedStage::new(dedup)));
        pipeline
    }

    /// Sets the observer for finished runs.
    #[must_use]
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Appends a stage.
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Returns the stage names in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage for one reservation.
    ///
    /// # Errors
    ///
    /// Returns the first stage error; later stages are not run.
    pub async fn run(&self, event: ReservationEvent) -> Result<PipelineReport> {
        let origin = event.origin;
        let mut ctx = PipelineContext::new(event);

        let mut failure = None;
        for stage in &self.stages {
            match stage.process(&mut ctx).await {
                Ok(StageFlow::Continue) => {},
                Ok(StageFlow::Stop) => break,
                Err(e) => {
                    tracing::error!(
                        stage = stage.name(),
                        reservation_id = ctx.reservation_id.as_deref(),
                        %origin,
                        error = %e,
                        "pipeline stage failed"
                    );
                    failure = Some(e);
                    break;
                },
            }
        }

        if let Some(claim) = ctx.claim.take() {
            claim.release().await;
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let result = ctx.outcome.map(|outcome| {
            let mut result = outcome.result;
            result.retries_enqueued = ctx.retries_enqueued;
            result
        });
        let report = PipelineReport { reservation_id: ctx.reservation_id, stage: ctx.stage, result };

        self.emit(&report, origin, self.clock.now()).await;
        Ok(report)
    }

    async fn emit(&self, report: &PipelineReport, origin: Origin, at: DateTime<Utc>) {
        let event = match (&report.result, report.skipped()) {
            (_, true) => {
                PipelineEvent::Skipped { reservation_id: report.reservation_id.clone(), origin, at }
            },
            (Some(result), false) => PipelineEvent::Dispatched { result: result.clone(), origin, at },
            (None, false) => return,
        };
        self.events.handle_event(event).await;
    }
}

/// Skips reservations that were already processed.
#[derive(Clone)]
pub struct DedupStage {
    dedup: DedupStore,
}

impl DedupStage {
    /// Creates the stage.
    pub fn new(dedup: DedupStore) -> Self {
        Self { dedup }
    }
}

#[async_trait]
impl Stage for DedupStage {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<StageFlow> {
        ctx.reservation_id = self.dedup.identifiers(&ctx.event.reservation).into_iter().next();

        if ctx.event.force {
            tracing::info!(reservation_id = ctx.reservation_id.as_deref(), "forced re-dispatch");
            ctx.advance(ReservationStage::DedupChecked);
            return Ok(StageFlow::Continue);
        }

        match self.dedup.admit(&ctx.event.reservation).await? {
            Admission::Accepted(claim) => {
                ctx.claim = claim;
                ctx.advance(ReservationStage::DedupChecked);
                Ok(StageFlow::Continue)
            },
            Admission::Duplicate | Admission::InFlight => {
                tracing::debug!(
                    reservation_id = ctx.reservation_id.as_deref(),
                    origin = %ctx.event.origin,
                    "reservation already processed or in flight, skipping"
                );
                ctx.advance(ReservationStage::Skipped);
                Ok(StageFlow::Stop)
            },
        }
    }
}

/// Fans the reservation out to every integration.
#[derive(Clone)]
pub struct DispatchStage {
    dispatcher: Dispatcher,
}

impl DispatchStage {
    /// Creates the stage.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Stage for DispatchStage {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<StageFlow> {
        ctx.advance(ReservationStage::Dispatching);
        let outcome =
            self.dispatcher.dispatch(&ctx.event.reservation, ctx.reservation_id.as_deref()).await;
        ctx.advance(ReservationStage::Dispatched(outcome.result.status));
        ctx.outcome = Some(outcome);
        Ok(StageFlow::Continue)
    }
}

/// Records the reservation as processed once dispatch was attempted.
#[derive(Clone)]
pub struct MarkProcessedStage {
    dedup: DedupStore,
}

impl MarkProcessedStage {
    /// Creates the stage.
    pub fn new(dedup: DedupStore) -> Self {
        Self { dedup }
    }
}

#[async_trait]
impl Stage for MarkProcessedStage {
    fn name(&self) -> &'static str {
        "mark_processed"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<StageFlow> {
        if ctx.outcome.is_some() {
            self.dedup.mark_processed(&ctx.event.reservation).await?;
        }
        Ok(StageFlow::Continue)
    }
}

/// Stores one retry per failed integration.
#[derive(Clone)]
pub struct RetryEnqueueStage {
    queue: RetryQueue,
}

impl RetryEnqueueStage {
    /// Creates the stage.
    pub fn new(queue: RetryQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Stage for RetryEnqueueStage {
    fn name(&self) -> &'static str {
        "retry_enqueue"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<StageFlow> {
        let Some(outcome) = &ctx.outcome else {
            return Ok(StageFlow::Continue);
        };

        let mut enqueued = 0;
        for retry in outcome.retries.clone() {
            self.queue.enqueue(retry).await?;
            enqueued += 1;
        }
        ctx.retries_enqueued = enqueued;
        Ok(StageFlow::Continue)
    }
}
