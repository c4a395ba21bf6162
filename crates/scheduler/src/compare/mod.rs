//! Regression comparison
//!
//! Once a run finishes, it is compared against each of its compare-with
//! targets as soon as that target has finished too. Targets may still be
//! queued or executing, so the comparator polls the run record store.
//!
//! This module provides:
//! - [`Comparator`] - polls for finished targets and notifies per match
//! - [`ComparatorConfig`] - poll interval, budget and message settings
//! - [`MeasurementSource`] - diffs the recorded results of two runs
//!
//! ```text
//!   finished run ──► poll store every interval ──► target finished?
//!                          ▲                           │ yes
//!                          │ no                        ▼
//!                          └──────────────  measurement source (micro|macro)
//!                                                      │
//!                                                      ▼
//!                                          notify once per target
//! ```

pub mod measurement;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::identifier::RunIdentifier;
use crate::notify::{Notifier, NotifyError};
use crate::persistence::{RunFilter, RunStore, StoreError};
use crate::reliability::duration_millis;

pub use measurement::{
    MacroSample, MeasurementError, MeasurementSource, Measurements, PostgresMacroSource,
    PostgresMicroSource, DEFAULT_THRESHOLD_PERCENT,
};

/// Default repository linked from notifications
pub const DEFAULT_REPOSITORY_URL: &str = "https://github.com/vitessio/vitess";

/// Comparison errors
#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    /// Store error while looking up targets
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Measurement source failure
    #[error("measurement error: {0}")]
    Measurement(#[from] MeasurementError),

    /// Notification could not be delivered
    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),

    /// Targets did not finish within the budget
    #[error("{unmatched} comparison target(s) did not finish within {budget:?}")]
    Timeout { unmatched: usize, budget: Duration },

    /// Shutdown was requested
    #[error("comparison cancelled")]
    Cancelled,
}

/// Comparator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparatorConfig {
    /// Delay between two lookups of the pending targets
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Wall-clock budget of one comparison, `None` waits forever
    #[serde(default, with = "optional_duration_millis")]
    pub timeout: Option<Duration>,

    /// Repository commit links point to
    pub repository_url: String,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(24 * 60 * 60)),
            repository_url: DEFAULT_REPOSITORY_URL.to_string(),
        }
    }
}

impl ComparatorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_repository_url(mut self, url: impl Into<String>) -> Self {
        self.repository_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Result of one comparison invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompareOutcome {
    /// Targets found finished and compared
    pub matched: usize,
    /// Notifications sent
    pub notified: usize,
}

/// Compares finished runs against their targets
pub struct Comparator {
    store: Arc<dyn RunStore>,
    measurements: Measurements,
    notifier: Arc<dyn Notifier>,
    config: ComparatorConfig,
}

impl Comparator {
    pub fn new(
        store: Arc<dyn RunStore>,
        measurements: Measurements,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            measurements,
            notifier,
            config: ComparatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ComparatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ComparatorConfig {
        &self.config
    }

    /// Compare `finished` against every target
    ///
    /// Sends at most one notification per distinct target. A notification
    /// is sent when the summary is non-empty, or always with
    /// `notify_always`. The first store, measurement or notifier error
    /// aborts the invocation. Only a `true` on `shutdown` cancels it; a
    /// dropped sender leaves the comparison running.
    #[instrument(skip(self, targets, shutdown), fields(run = %finished, targets = targets.len()))]
    pub async fn compare(
        &self,
        finished: &RunIdentifier,
        targets: &[RunIdentifier],
        notify_always: bool,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<CompareOutcome, CompareError> {
        let mut pending: Vec<&RunIdentifier> = Vec::new();
        for target in targets {
            if !pending.contains(&target) {
                pending.push(target);
            }
        }

        let deadline = self
            .config
            .timeout
            .map(|budget| (tokio::time::Instant::now() + budget, budget));
        let mut matched: HashSet<&RunIdentifier> = HashSet::new();
        let mut outcome = CompareOutcome::default();
        let mut signal_open = true;

        while matched.len() < pending.len() {
            if *shutdown.borrow() {
                return Err(CompareError::Cancelled);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed(), if signal_open => {
                    if changed.is_err() {
                        signal_open = false;
                        continue;
                    }
                    if *shutdown.borrow() {
                        debug!("Shutdown signal received while comparing");
                        return Err(CompareError::Cancelled);
                    }
                }
            }

            for &target in &pending {
                if matched.contains(target) {
                    continue;
                }
                let found = self
                    .store
                    .find_finished(&RunFilter::for_identifier(target))
                    .await?;
                if found.is_none() {
                    continue;
                }

                let summary = self
                    .measurements
                    .for_kind(&finished.kind())
                    .compare(finished, target)
                    .await?;

                if !summary.is_empty() || notify_always {
                    let message = self.render_message(finished, target, &summary);
                    self.notifier.send(&message).await?;
                    outcome.notified += 1;
                }
                matched.insert(target);
                outcome.matched += 1;
                info!(target_ref = %target.git_ref, regression = !summary.is_empty(), "Compared against target");
            }

            if let Some((deadline, budget)) = deadline {
                if matched.len() < pending.len() && tokio::time::Instant::now() >= deadline {
                    let unmatched: Vec<String> = pending
                        .iter()
                        .filter(|t| !matched.contains(**t))
                        .map(|t| t.to_string())
                        .collect();
                    warn!(?unmatched, "Comparison targets never finished");
                    return Err(CompareError::Timeout {
                        unmatched: unmatched.len(),
                        budget,
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// Message sent for one compared pair
    pub fn render_message(
        &self,
        current: &RunIdentifier,
        target: &RunIdentifier,
        summary: &str,
    ) -> String {
        let header = if summary.is_empty() {
            "Benchmark comparison."
        } else {
            "Observed a regression."
        };
        let repo = &self.config.repository_url;

        let mut message = format!(
            "{header}\n\nBenchmark: {}",
            current.benchmark_type
        );
        if !current.planner_version.is_empty() {
            message.push_str(&format!(" (planner {})", current.planner_version));
        }
        if current.pull_nb > 0 {
            message.push_str(&format!("\nPull request: {repo}/pull/{}", current.pull_nb));
        }
        message.push_str(&format!(
            "\nComparing <{repo}/commit/{}|{}> ({}) with <{repo}/commit/{}|{}> ({})\n\n",
            current.git_ref,
            current.short_ref(),
            current.source,
            target.git_ref,
            target.short_ref(),
            target.source,
        ));
        if summary.is_empty() {
            message.push_str("No regression observed.");
        } else {
            message.push_str(summary);
        }
        message
    }
}

/// Serde support for `Option<Duration>` as milliseconds
mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
