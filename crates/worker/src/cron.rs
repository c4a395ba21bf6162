// Periodic submission of the repository HEAD

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use benchrun_scheduler::{RunIdentifier, Scheduler, SubmitRequest};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::source::SourceRepo;

/// Source name of cron submissions
pub const CRON_SOURCE: &str = "cron";

/// Shortest accepted cron interval
pub const MIN_CRON_INTERVAL: Duration = Duration::from_secs(1);

/// Submits one request per benchmark type for the current HEAD
///
/// Each request is compared with the previous finished cron run of the same
/// benchmark type, when there is one.
pub struct CronSubmitter {
    scheduler: Arc<Scheduler>,
    source: SourceRepo,
    benchmarks: Vec<String>,
    run_config: PathBuf,
    interval: Duration,
}

impl CronSubmitter {
    pub fn new(
        scheduler: Arc<Scheduler>,
        source: SourceRepo,
        benchmarks: Vec<String>,
        run_config: PathBuf,
        interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            source,
            benchmarks,
            run_config,
            interval: interval.max(MIN_CRON_INTERVAL),
        }
    }

    /// Submit every configured benchmark for `git_ref`, returning how many
    /// were accepted
    pub async fn submit_ref(&self, git_ref: &str) -> Result<usize> {
        let mut accepted = 0;
        for benchmark_type in &self.benchmarks {
            let identifier = RunIdentifier::new(CRON_SOURCE, git_ref, benchmark_type.as_str());
            let mut request = SubmitRequest::new(identifier, &self.run_config);

            let previous = self
                .scheduler
                .get_previous_finished(CRON_SOURCE, benchmark_type, git_ref)
                .await
                .context("Failed to look up the previous cron run")?;
            if let Some(previous) = previous {
                request = request.compare_with(previous);
            }

            let submission = self
                .scheduler
                .submit(request)
                .await
                .context("Failed to submit cron run")?;
            debug!(%benchmark_type, git_ref, ?submission, "Cron submission");
            if submission.is_accepted() {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Sync the clone and submit its HEAD
    pub async fn tick(&self) -> Result<usize> {
        self.source
            .sync()
            .await
            .context("Failed to sync source repository")?;
        let head = self.source.head().await?;
        let accepted = self.submit_ref(&head).await?;
        info!(git_ref = %head, accepted, "Cron tick");
        Ok(accepted)
    }

    /// Tick every interval until shutdown; failed ticks are logged
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, benchmarks = ?self.benchmarks, "Starting cron loop");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("Cron loop: shutdown requested");
                    break;
                }
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "Cron tick failed");
            }
        }
    }
}
