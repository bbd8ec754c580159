//! Request middleware: admin token checks and traffic-triggered lag checks.

pub mod admin;
pub mod traffic;

pub use admin::require_admin_token;
pub use traffic::observe_traffic;
