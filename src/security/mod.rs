//! Admission control shared by all sessions.

pub mod rate_limiter;

pub use rate_limiter::{CounterStore, FixedWindowLimiter};
