// Worker configuration
//
// Sources, lowest precedence first:
// 1. Built-in defaults
// 2. TOML file named by BENCHRUN_CONFIG
// 3. Environment variables (a `.env` file is loaded by the binary)

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use benchrun_scheduler::compare::{DEFAULT_REPOSITORY_URL, DEFAULT_THRESHOLD_PERCENT};
use benchrun_scheduler::{
    ComparatorConfig, SchedulerConfig, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_SHUTDOWN_GRACE,
    MIN_DISPATCH_INTERVAL,
};
use serde::Deserialize;

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Postgres connection string, in-memory dev mode when unset
    pub database_url: Option<String>,

    /// Maximum number of runs executing at once
    pub max_concurrent_jobs: usize,

    /// Delay between two dispatch attempts
    #[serde(with = "duration_millis")]
    pub dispatch_interval: Duration,

    /// Wall-clock budget of one execution
    #[serde(with = "duration_secs")]
    pub execution_timeout: Duration,

    /// Retry budget of each submission
    pub run_retries: u32,

    /// Time running executions get to finish on shutdown
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Delay between two comparison lookups
    #[serde(with = "duration_millis")]
    pub compare_poll_interval: Duration,

    /// Budget of one comparison, 0 waits forever
    #[serde(with = "duration_secs")]
    pub compare_timeout: Duration,

    /// Regression threshold of the measurement sources, in percent
    pub regression_threshold_percent: f64,

    /// Slack incoming webhook, notifications are only logged when unset
    pub slack_webhook_url: Option<String>,

    /// Benchmarked repository, used for commit links and cloning
    pub repository_url: String,

    /// Local clone of the repository
    pub source_dir: PathBuf,

    /// Branch the cron loop follows
    pub source_branch: String,

    /// Run configuration file used for cron submissions
    pub run_config: PathBuf,

    /// Delay between two cron submissions, 0 disables the cron loop
    #[serde(with = "duration_secs")]
    pub cron_interval: Duration,

    /// Benchmark types submitted by the cron loop
    pub cron_benchmarks: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_concurrent_jobs: 1,
            dispatch_interval: Duration::from_secs(1),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            run_retries: 2,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            compare_poll_interval: Duration::from_secs(1),
            compare_timeout: Duration::from_secs(24 * 60 * 60),
            regression_threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            slack_webhook_url: None,
            repository_url: DEFAULT_REPOSITORY_URL.to_string(),
            source_dir: PathBuf::from("/var/lib/benchrun/source"),
            source_branch: "main".to_string(),
            run_config: PathBuf::from("/etc/benchrun/run.toml"),
            cron_interval: Duration::ZERO,
            cron_benchmarks: vec!["micro".to_string(), "oltp".to_string(), "tpcc".to_string()],
        }
    }
}

impl WorkerConfig {
    /// Load the configuration file named by `BENCHRUN_CONFIG` (if any), then
    /// apply environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("BENCHRUN_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML configuration file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Override fields from variables resolved by `lookup`
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(max) = parsed("MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = (max as usize).max(1);
        }
        if let Some(ms) = parsed("DISPATCH_INTERVAL_MS") {
            self.dispatch_interval = Duration::from_millis(ms).max(MIN_DISPATCH_INTERVAL);
        }
        if let Some(secs) = parsed("EXECUTION_TIMEOUT_SECS") {
            self.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parsed("RUN_RETRIES") {
            self.run_retries = retries as u32;
        }
        if let Some(secs) = parsed("SHUTDOWN_GRACE_SECS") {
            self.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(ms) = parsed("COMPARE_POLL_INTERVAL_MS") {
            self.compare_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed("COMPARE_TIMEOUT_SECS") {
            self.compare_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) =
            lookup("REGRESSION_THRESHOLD_PERCENT").and_then(|v| v.trim().parse::<f64>().ok())
        {
            self.regression_threshold_percent = threshold;
        }
        if let Some(url) = lookup("SLACK_WEBHOOK_URL").filter(|v| !v.is_empty()) {
            self.slack_webhook_url = Some(url);
        }
        if let Some(url) = lookup("REPOSITORY_URL") {
            self.repository_url = url;
        }
        if let Some(dir) = lookup("SOURCE_DIR") {
            self.source_dir = PathBuf::from(dir);
        }
        if let Some(branch) = lookup("SOURCE_BRANCH") {
            self.source_branch = branch;
        }
        if let Some(path) = lookup("RUN_CONFIG") {
            self.run_config = PathBuf::from(path);
        }
        if let Some(secs) = parsed("CRON_INTERVAL_SECS") {
            self.cron_interval = Duration::from_secs(secs);
        }
        if let Some(list) = lookup("CRON_BENCHMARKS") {
            self.cron_benchmarks = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_concurrent_jobs(self.max_concurrent_jobs)
            .with_dispatch_interval(self.dispatch_interval)
            .with_default_retries(self.run_retries)
            .with_shutdown_grace(self.shutdown_grace)
    }

    pub fn comparator_config(&self) -> ComparatorConfig {
        let timeout = (!self.compare_timeout.is_zero()).then_some(self.compare_timeout);
        ComparatorConfig::default()
            .with_poll_interval(self.compare_poll_interval)
            .with_timeout(timeout)
            .with_repository_url(self.repository_url.clone())
    }

    pub fn cron_enabled(&self) -> bool {
        !self.cron_interval.is_zero() && !self.cron_benchmarks.is_empty()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
