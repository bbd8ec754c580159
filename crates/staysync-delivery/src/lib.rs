//! Reliable forwarding of hotel reservations to downstream integrations.
//!
//! Reservations arrive by webhook or by polling the upstream reservation
//! API. Each one runs through a [`pipeline::Pipeline`] that deduplicates it
//! against every identifier it has ever been seen under, fans it out to all
//! enabled integrations concurrently and queues failed deliveries for retry.
//!
//! # Architecture
//!
//! 1. **Dedup** - [`dedup::DedupStore`] merges identifiers into one identity
//!    and refuses reservations already processed
//! 2. **Dispatch** - [`dispatcher::Dispatcher`] sends to every integration,
//!    checking the per-integration circuit breaker and rate limit first
//! 3. **Retry** - [`retry::RetryQueue`] persists failed calls and replays
//!    them with capped exponential backoff
//! 4. **Polling** - [`poller::AdaptivePoller`] runs the continuous and
//!    deep-check tiers under a distributed lock and heals dead timers
//!
//! All state lives behind [`storage::ReliabilityStorage`], backed by
//! PostgreSQL in production and by memory in tests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use staysync_core::RealClock;
//! use staysync_delivery::{
//!     circuit::CircuitBreakerManager,
//!     client::HttpTransport,
//!     dedup::DedupStore,
//!     dispatcher::Dispatcher,
//!     pipeline::Pipeline,
//!     rate_limit::RateLimiter,
//!     retry::{RetryQueue, RetryQueueConfig},
//!     storage::memory::MemoryStorage,
//! };
//!
//! # fn example() -> staysync_delivery::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let clock = Arc::new(RealClock::new());
//! let transport = Arc::new(HttpTransport::with_defaults()?);
//! let circuit = CircuitBreakerManager::new(Default::default(), storage.clone(), clock.clone());
//!
//! let dispatcher = Dispatcher::new(
//!     Vec::new(),
//!     circuit.clone(),
//!     RateLimiter::new(storage.clone(), clock.clone()),
//!     transport.clone(),
//!     Default::default(),
//!     clock.clone(),
//! );
//! let retry_queue =
//!     RetryQueue::new(RetryQueueConfig::default(), storage.clone(), circuit, transport, clock.clone());
//! let pipeline =
//!     Pipeline::standard(DedupStore::new(storage, clock.clone()), dispatcher, retry_queue, clock);
//! # let _ = pipeline;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod client;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod integration;
pub mod pipeline;
pub mod poller;
pub mod rate_limit;
pub mod retry;
pub mod source;
pub mod storage;
pub mod tasks;

pub use error::{DeliveryError, ErrorCategory, Result};
