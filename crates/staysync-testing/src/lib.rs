//! Test infrastructure for deterministic staysync tests.
//!
//! Provides reservation builders, scripted doubles for every external seam
//! (outbound HTTP, the upstream reservation API, the task scheduler) and a
//! [`TestEnv`] that wires the real components over them with an in-memory
//! store and a controllable clock. [`TestDatabase`] provides an isolated
//! PostgreSQL schema for exercising the SQL repositories.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod env;
pub mod events;
pub mod fixtures;
pub mod scheduler;
pub mod source;
pub mod transport;

pub use database::TestDatabase;
pub use env::{TestEnv, TestEnvBuilder};
pub use events::RecordingEventHandler;
pub use fixtures::{integration, integration_url, rate_limited_integration, reservation, ReservationBuilder};
pub use scheduler::RecordingTaskScheduler;
pub use source::StaticReservationSource;
pub use staysync_core::TestClock;
pub use transport::{Reply, ScriptedTransport};

/// Installs a test-writer tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
