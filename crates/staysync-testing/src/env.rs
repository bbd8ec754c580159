//! Fully wired in-memory environment.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use staysync_core::{models::Reservation, TestClock};
use staysync_delivery::{
    circuit::{CircuitBreakerManager, CircuitConfig},
    dedup::DedupStore,
    dispatcher::Dispatcher,
    events::Origin,
    integration::{Integration, JsonIntegration, JsonIntegrationConfig},
    pipeline::{Pipeline, PipelineReport, ReservationEvent},
    poller::{AdaptivePoller, PollerConfig},
    rate_limit::RateLimiter,
    retry::{RetryPolicy, RetryQueue, RetryQueueConfig},
    storage::memory::MemoryStorage,
    Result,
};

use crate::{
    events::RecordingEventHandler, scheduler::RecordingTaskScheduler, source::StaticReservationSource,
    transport::ScriptedTransport,
};

/// Builder for [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    integrations: Vec<JsonIntegrationConfig>,
    circuit: CircuitConfig,
    policy: RetryPolicy,
    poller: PollerConfig,
    start: Option<DateTime<Utc>>,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            integrations: Vec::new(),
            circuit: CircuitConfig::default(),
            policy: RetryPolicy::default(),
            poller: PollerConfig::default(),
            start: None,
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with no integrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an integration.
    #[must_use]
    pub fn integration(mut self, config: JsonIntegrationConfig) -> Self {
        self.integrations.push(config);
        self
    }

    /// Sets the circuit breaker thresholds.
    #[must_use]
    pub fn circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = config;
        self
    }

    /// Sets the retry backoff policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the poller configuration.
    #[must_use]
    pub fn poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Starts the clock at a fixed time.
    #[must_use]
    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start = Some(at);
        self
    }

    /// Wires every component over shared in-memory doubles.
    pub fn build(self) -> TestEnv {
        let storage = Arc::new(MemoryStorage::new());
        let clock = self.start.map_or_else(TestClock::new, TestClock::with_start_time);
        let transport = ScriptedTransport::new();
        let source = StaticReservationSource::new();
        let scheduler = RecordingTaskScheduler::new();
        let events = RecordingEventHandler::new();

        let shared_clock: Arc<dyn staysync_core::Clock> = Arc::new(clock.clone());
        let shared_transport = Arc::new(transport.clone());

        let rate_limits: HashMap<_, _> = self
            .integrations
            .iter()
            .filter_map(|config| config.rate_limit.map(|limit| (config.name.clone(), limit)))
            .collect();
        let integrations: Vec<Arc<dyn Integration>> = self
            .integrations
            .into_iter()
            .map(|config| Arc::new(JsonIntegration::new(config)) as Arc<dyn Integration>)
            .collect();

        let circuit = CircuitBreakerManager::new(self.circuit, storage.clone(), shared_clock.clone());
        let dedup = DedupStore::new(storage.clone(), shared_clock.clone());
        let dispatcher = Dispatcher::new(
            integrations,
            circuit.clone(),
            RateLimiter::new(storage.clone(), shared_clock.clone()),
            shared_transport.clone(),
            self.policy.clone(),
            shared_clock.clone(),
        );
        let retry_queue = RetryQueue::new(
            RetryQueueConfig { policy: self.policy, ..RetryQueueConfig::default() },
            storage.clone(),
            circuit.clone(),
            shared_transport,
            shared_clock.clone(),
        )
        .with_rate_limits(rate_limits);
        let pipeline = Pipeline::standard(
            dedup.clone(),
            dispatcher.clone(),
            retry_queue.clone(),
            shared_clock.clone(),
        )
        .with_event_handler(Arc::new(events.clone()));
        let poller = AdaptivePoller::new(
            self.poller,
            storage.clone(),
            Arc::new(source.clone()),
            pipeline.clone(),
            retry_queue.clone(),
            Arc::new(scheduler.clone()),
            shared_clock,
        );

        TestEnv {
            storage,
            clock,
            transport,
            source,
            scheduler,
            events,
            circuit,
            dedup,
            dispatcher,
            retry_queue,
            pipeline,
            poller,
        }
    }
}

/// In-memory environment for scenario tests.
///
/// Fields are shared handles; advancing `clock` or scripting `transport`
/// affects every wired component.
#[derive(Clone)]
pub struct TestEnv {
    /// Shared store.
    pub storage: Arc<MemoryStorage>,
    /// Controllable clock.
    pub clock: TestClock,
    /// Outbound transport double.
    pub transport: ScriptedTransport,
    /// Upstream reservation API double.
    pub source: StaticReservationSource,
    /// Task scheduler double.
    pub scheduler: RecordingTaskScheduler,
    /// Recorded pipeline events.
    pub events: RecordingEventHandler,
    /// Circuit breakers.
    pub circuit: CircuitBreakerManager,
    /// Identity store.
    pub dedup: DedupStore,
    /// Fan-out dispatcher.
    pub dispatcher: Dispatcher,
    /// Retry queue.
    pub retry_queue: RetryQueue,
    /// Standard pipeline.
    pub pipeline: Pipeline,
    /// Adaptive poller.
    pub poller: AdaptivePoller,
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv").field("now", &self.now()).finish_non_exhaustive()
    }
}

impl TestEnv {
    /// Starts a builder.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Runs a reservation through the pipeline as a webhook delivery.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's error.
    pub async fn ingest(&self, reservation: Reservation) -> Result<PipelineReport> {
        self.pipeline.run(ReservationEvent::new(reservation, Origin::Webhook)).await
    }

    /// Advances the clock.
    pub fn advance(&self, duration: std::time::Duration) {
        self.clock.advance(duration);
    }

    /// Current test time.
    pub fn now(&self) -> DateTime<Utc> {
        staysync_core::Clock::now(&self.clock)
    }
}
