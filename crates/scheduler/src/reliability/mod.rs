//! Reliability patterns for run execution
//!
//! This module provides:
//! - [`RetryPolicy`] - attempt budget and spacing of in-place retries

mod retry;

pub use retry::RetryPolicy;
pub(crate) use retry::duration_millis;
