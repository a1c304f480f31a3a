//! Admission control and retry helpers.

pub mod rate_window;
pub mod retry;

pub use rate_window::{RateWindowLimiter, spawn_sweep_task};
pub use retry::{RetryPolicy, RetryableError, with_retry, with_retry_if};
