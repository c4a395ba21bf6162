//! Execution queue and scheduler
//!
//! The queue holds at most one element per [`RunIdentifier`]. A dispatch
//! loop admits one element per tick while fewer than
//! `max_concurrent_jobs` are in flight. Each admitted element runs up to
//! `retry + 1` attempts; on success its comparison is spawned, and in every
//! case the element leaves the queue and releases its slot together.
//!
//! ```text
//!  submit ──► dedup (store, then queue) ──► queue ──► dispatch tick
//!                                                        │ in_flight < max
//!                                                        ▼
//!                                          attempt 1..=retry+1 (RunExecutor)
//!                                             │ success          │ exhausted
//!                                             ▼                  ▼
//!                                     spawn comparison    remove + release
//!                                     remove + release
//! ```

mod scheduler;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identifier::RunIdentifier;
use crate::persistence::StoreError;
use crate::reliability::{duration_millis, RetryPolicy};

pub use scheduler::Scheduler;

/// Default retry budget of a submission
pub const DEFAULT_RETRIES: u32 = 2;

/// Shortest accepted dispatch interval
pub const MIN_DISPATCH_INTERVAL: Duration = Duration::from_millis(1);

/// Default time running elements get to finish after shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of elements executing at once
    pub max_concurrent_jobs: usize,

    /// Delay between two dispatch attempts
    #[serde(with = "duration_millis")]
    pub dispatch_interval: Duration,

    /// Retry budget of requests that do not set one
    pub default_retries: u32,

    /// Spacing between attempts of one element
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Time running elements get to finish once shutdown is requested
    #[serde(default = "default_shutdown_grace", with = "duration_millis")]
    pub shutdown_grace: Duration,
}

fn default_shutdown_grace() -> Duration {
    DEFAULT_SHUTDOWN_GRACE
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            dispatch_interval: Duration::from_secs(1),
            default_retries: DEFAULT_RETRIES,
            retry_policy: RetryPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl SchedulerConfig {
    /// Set the concurrency ceiling
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Set the dispatch interval, at least [`MIN_DISPATCH_INTERVAL`]
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval.max(MIN_DISPATCH_INTERVAL);
        self
    }

    /// Set the default retry budget
    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Clamp values that bypassed the builders (deserialized configs)
    pub fn normalized(self) -> Self {
        let dispatch_interval = self.dispatch_interval;
        let max_concurrent_jobs = self.max_concurrent_jobs;
        self.with_dispatch_interval(dispatch_interval)
            .with_max_concurrent_jobs(max_concurrent_jobs)
    }
}

/// Request to run a benchmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub identifier: RunIdentifier,
    /// Run configuration file
    pub config_path: PathBuf,
    /// Retry budget, the scheduler default when unset
    #[serde(default)]
    pub retry: Option<u32>,
    /// Notify even when no regression is observed
    #[serde(default)]
    pub notify_always: bool,
    /// Identifiers to compare against once finished
    #[serde(default)]
    pub compare_with: Vec<RunIdentifier>,
}

impl SubmitRequest {
    pub fn new(identifier: RunIdentifier, config_path: impl Into<PathBuf>) -> Self {
        Self {
            identifier,
            config_path: config_path.into(),
            retry: None,
            notify_always: false,
            compare_with: vec![],
        }
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_notify_always(mut self, notify_always: bool) -> Self {
        self.notify_always = notify_always;
        self
    }

    /// Add a compare-with target
    pub fn compare_with(mut self, target: RunIdentifier) -> Self {
        self.compare_with.push(target);
        self
    }
}

/// Why a submission was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    /// An element with the same identifier is queued or executing
    Queued,
    /// A finished run with the same identifier exists
    AlreadyFinished,
}

/// Outcome of [`Scheduler::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Duplicate(DuplicateReason),
}

impl Submission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Pending or executing unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct QueueElement {
    pub identifier: RunIdentifier,
    pub config_path: PathBuf,
    /// Attempts left after the first one
    pub retry: u32,
    pub executing: bool,
    pub notify_always: bool,
    pub compare_with: Vec<RunIdentifier>,
    /// Admission order
    pub(crate) seq: u64,
}

impl QueueElement {
    /// Total number of attempts this element may use
    pub fn max_attempts(&self) -> u32 {
        self.retry.saturating_add(1)
    }
}

/// How an element left the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementOutcome {
    /// An attempt succeeded
    Succeeded { attempts: u32 },
    /// Every attempt failed
    Exhausted { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_builder() {
        let target = RunIdentifier::new("cron", "bbb", "micro");
        let request = SubmitRequest::new(RunIdentifier::new("cron", "aaa", "micro"), "/etc/b.toml")
            .with_retry(0)
            .with_notify_always(true)
            .compare_with(target.clone());

        assert_eq!(request.retry, Some(0));
        assert!(request.notify_always);
        assert_eq!(request.compare_with, vec![target]);
    }

    #[test]
    fn test_config_clamps_ceiling() {
        let config = SchedulerConfig::default().with_max_concurrent_jobs(0);
        assert_eq!(config.max_concurrent_jobs, 1);
    }

    #[test]
    fn test_config_from_json() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{"max_concurrent_jobs": 3, "dispatch_interval": 250, "default_retries": 1}"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.dispatch_interval, Duration::from_millis(250));
        assert_eq!(config.retry_policy, RetryPolicy::immediate());
        assert_eq!(config.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }

    #[test]
    fn test_zero_dispatch_interval_is_clamped() {
        let config = SchedulerConfig::default().with_dispatch_interval(Duration::ZERO);
        assert_eq!(config.dispatch_interval, MIN_DISPATCH_INTERVAL);

        let config: SchedulerConfig = serde_json::from_str(
            r#"{"max_concurrent_jobs": 0, "dispatch_interval": 0, "default_retries": 1}"#,
        )
        .unwrap();
        let config = config.normalized();
        assert_eq!(config.dispatch_interval, MIN_DISPATCH_INTERVAL);
        assert_eq!(config.max_concurrent_jobs, 1);
    }

    #[test]
    fn test_max_attempts() {
        let element = QueueElement {
            identifier: RunIdentifier::new("cron", "aaa", "micro"),
            config_path: PathBuf::from("b.toml"),
            retry: 2,
            executing: false,
            notify_always: false,
            compare_with: vec![],
            seq: 0,
        };
        assert_eq!(element.max_attempts(), 3);
    }
}
