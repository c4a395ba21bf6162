//! # Benchmark Execution Scheduler
//!
//! Schedules benchmark runs against an evolving source tree, executes them
//! on pluggable infrastructure and compares finished runs to detect
//! performance regressions.
//!
//! ## Features
//!
//! - **Deduplication**: at most one queued element per [`RunIdentifier`], and
//!   nothing is queued for an identifier that already finished
//! - **Concurrency ceiling**: a fixed number of runs execute at once
//! - **Retry in place**: a failed element is retried up to its budget before
//!   it is dropped
//! - **Run lifecycle**: every started run ends Finished or Failed in the
//!   record store, timeouts and panics included
//! - **Regression comparison**: finished runs are diffed against their
//!   compare-with targets as soon as those finish too
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (dedup queue, dispatch loop, concurrency ceiling, retries) │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                  │ on success
//!                ▼                                  ▼
//! ┌─────────────────────────────┐   ┌───────────────────────────┐
//! │ LifecycleExecutor / Run     │   │ Comparator                │
//! │ (create, prepare, execute)  │   │ (poll targets, notify)    │
//! └─────────────────────────────┘   └───────────────────────────┘
//!                │                                  │
//!                ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                RunStore (PostgreSQL / in-memory)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use benchrun_scheduler::prelude::*;
//!
//! let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
//! let executor = Arc::new(LifecycleExecutor::new(store.clone()));
//! let scheduler = Scheduler::new(SchedulerConfig::default(), store, executor, None);
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! tokio::spawn(scheduler.clone().run(shutdown_rx));
//!
//! let identifier = RunIdentifier::new("cron", "a1b2c3d4e5f6", "micro");
//! scheduler
//!     .submit(SubmitRequest::new(identifier, "/etc/benchrun/micro.toml"))
//!     .await?;
//! ```

pub mod compare;
pub mod identifier;
pub mod infra;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod run;

/// Prelude for common imports
pub mod prelude {
    pub use crate::compare::{
        Comparator, ComparatorConfig, CompareError, MeasurementSource, Measurements,
    };
    pub use crate::identifier::{BenchmarkKind, RunIdentifier, RunStatus};
    pub use crate::infra::{DefaultInfraFactory, Infra, InfraConfig, InfraFactory, WorkflowConfig};
    pub use crate::notify::{LogNotifier, Notifier, SlackNotifier};
    pub use crate::persistence::{
        InMemoryRunStore, PostgresRunStore, RunFilter, RunRecord, RunStore, StoreError,
    };
    pub use crate::queue::{Scheduler, SchedulerConfig, SchedulerError, SubmitRequest, Submission};
    pub use crate::reliability::RetryPolicy;
    pub use crate::run::{LifecycleExecutor, Run, RunConfig, RunError, RunExecutor};
}

// Re-export main types at crate root
pub use compare::{
    CompareError, CompareOutcome, Comparator, ComparatorConfig, MeasurementError,
    MeasurementSource, Measurements, PostgresMacroSource, PostgresMicroSource,
};
pub use identifier::{shorten_ref, BenchmarkKind, RunIdentifier, RunStatus};
pub use infra::{DefaultInfraFactory, Infra, InfraConfig, InfraError, InfraFactory, LocalInfra, WorkflowConfig};
pub use notify::{LogNotifier, Notifier, NotifyError, SlackNotifier};
pub use persistence::{InMemoryRunStore, PostgresRunStore, RunFilter, RunRecord, RunStore, StoreError};
pub use queue::{
    DuplicateReason, ElementOutcome, QueueElement, Scheduler, SchedulerConfig, SchedulerError,
    SubmitRequest, Submission, DEFAULT_SHUTDOWN_GRACE, MIN_DISPATCH_INTERVAL,
};
pub use reliability::RetryPolicy;
pub use run::{LifecycleExecutor, Run, RunConfig, RunError, RunExecutor, DEFAULT_EXECUTION_TIMEOUT};
