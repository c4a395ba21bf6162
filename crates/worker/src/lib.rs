//! Benchmark worker process
//!
//! Wires the scheduler library into a long-running service:
//! - [`WorkerConfig`] - configuration from `.env`, an optional TOML file and
//!   the environment
//! - [`telemetry`] - log subscriber initialization
//! - [`SourceRepo`] - local clone of the benchmarked repository
//! - [`CronSubmitter`] - periodic submission of the repository HEAD

pub mod config;
pub mod cron;
pub mod source;
pub mod telemetry;

pub use config::WorkerConfig;
pub use cron::{CronSubmitter, CRON_SOURCE, MIN_CRON_INTERVAL};
pub use source::SourceRepo;
