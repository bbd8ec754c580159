//! Core domain models and infrastructure primitives.
//!
//! Provides the reservation map wrapper, reliability records (identities,
//! circuits, retry entries, rate windows, poll cursors), the error taxonomy
//! for storage operations, the clock abstraction, and PostgreSQL
//! repositories. All other crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    CircuitRecord, CircuitState, DispatchResult, DispatchStatus, IdentityMerge, NewRetryEntry,
    PollCursor, RateLimitWindow, Reservation, ReservationIdentity, RetryEntry, RetryPriority,
    RetryStatus, SchedulerLock,
};
pub use time::{Clock, RealClock, TestClock};
