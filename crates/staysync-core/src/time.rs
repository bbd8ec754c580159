//! Time abstractions for testable timing operations.
//!
//! Every component that compares timestamps (breaker recovery, rate windows,
//! retry schedules, poll lag, replay windows) reads time through `Clock` so
//! tests can drive hours of wall-clock behavior deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`, tests inject `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to tokio::time::sleep, in tests this
    /// advances virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock implementation using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

/// Test clock for deterministic time control.
///
/// Clones share the same underlying time, so a clock handed to a component
/// can be advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Milliseconds since UNIX epoch
    epoch_ms: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a new test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self { epoch_ms: Arc::new(AtomicI64::new(start.timestamp_millis())) }
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.epoch_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Jumps the clock to a specific time. Backwards jumps are allowed.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        self.epoch_ms.store(time.timestamp_millis(), Ordering::Release);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.epoch_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // In tests, sleep just advances the clock
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let clock = TestClock::with_start_time(start);

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let handle = clock.clone();
        let before = clock.now();

        handle.advance(Duration::from_secs(5));

        assert_eq!(clock.now() - before, chrono::Duration::seconds(5));
    }

    #[test]
    fn test_clock_jump() {
        let clock = TestClock::new();
        let target = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();

        clock.jump_to(target);

        assert_eq!(clock.now(), target);
    }

    #[tokio::test]
    async fn test_clock_sleep_advances_time() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.now() - start, chrono::Duration::seconds(5));
    }
}
