//! HTTP request handlers.
//!
//! - `webhook`: authenticated reservation push endpoint
//! - `poll`: poll entrypoint for external cron
//! - `admin`: manual re-dispatch and polling statistics
//! - `health`: liveness and store check

pub mod admin;
pub mod health;
pub mod poll;
pub mod webhook;

pub use admin::{polling_stats, redispatch_reservation};
pub use health::health_check;
pub use poll::trigger_poll;
pub use webhook::receive_reservation;
