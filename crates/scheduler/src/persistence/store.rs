//! RunStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identifier::{RunIdentifier, RunStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Database error (store unreachable or query failed)
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A run as persisted in the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub source: String,
    pub git_ref: String,
    pub benchmark_type: String,
    pub planner_version: String,
    pub pull_nb: i32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Build a fresh record with status [`RunStatus::Created`]
    pub fn created(id: Uuid, identifier: &RunIdentifier) -> Self {
        Self {
            id,
            source: identifier.source.clone(),
            git_ref: identifier.git_ref.clone(),
            benchmark_type: identifier.benchmark_type.clone(),
            planner_version: identifier.planner_version.clone(),
            pull_nb: identifier.pull_nb,
            status: RunStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Identifier this record was created for
    pub fn identifier(&self) -> RunIdentifier {
        RunIdentifier {
            source: self.source.clone(),
            git_ref: self.git_ref.clone(),
            benchmark_type: self.benchmark_type.clone(),
            planner_version: self.planner_version.clone(),
            pull_nb: self.pull_nb,
        }
    }
}

/// Attribute predicate used for lookups
///
/// `None` fields are not constrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub source: Option<String>,
    pub git_ref: Option<String>,
    pub benchmark_type: Option<String>,
    pub planner_version: Option<String>,
    pub pull_nb: Option<i32>,
}

impl RunFilter {
    /// Filter matching the given identifier.
    ///
    /// Micro benchmarks ignore the planner version.
    pub fn for_identifier(identifier: &RunIdentifier) -> Self {
        let planner_version = if identifier.kind().is_micro() {
            None
        } else {
            Some(identifier.planner_version.clone())
        };
        Self {
            source: Some(identifier.source.clone()),
            git_ref: Some(identifier.git_ref.clone()),
            benchmark_type: Some(identifier.benchmark_type.clone()),
            planner_version,
            pull_nb: Some(identifier.pull_nb),
        }
    }

    /// Whether a record satisfies this filter
    pub fn matches(&self, record: &RunRecord) -> bool {
        fn eq<T: PartialEq>(want: &Option<T>, got: &T) -> bool {
            want.as_ref().map_or(true, |w| w == got)
        }
        eq(&self.source, &record.source)
            && eq(&self.git_ref, &record.git_ref)
            && eq(&self.benchmark_type, &record.benchmark_type)
            && eq(&self.planner_version, &record.planner_version)
            && eq(&self.pull_nb, &record.pull_nb)
    }
}

/// Store for run records
///
/// This trait defines the interface the scheduler uses to persist and query
/// runs. Implementations must be thread-safe and support concurrent access.
/// It is the single source of truth for "has this identifier already
/// finished"; callers query it instead of caching.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Insert a new run record
    async fn insert(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Update a run's status.
    ///
    /// Sets `started_at` when moving to Started and `finished_at` when moving
    /// to a terminal status.
    async fn update_status(
        &self,
        id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Get a run by id
    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError>;

    /// Whether at least one run matches the filter with the given status
    async fn exists(&self, filter: &RunFilter, status: RunStatus) -> Result<bool, StoreError>;

    /// Most recent finished run matching the filter
    async fn find_finished(&self, filter: &RunFilter) -> Result<Option<RunRecord>, StoreError>;

    /// Most recent finished run for `source` and `benchmark_type` whose git
    /// reference differs from `excluding_git_ref`, ordered by start time
    async fn previous_finished(
        &self,
        source: &str,
        benchmark_type: &str,
        excluding_git_ref: &str,
    ) -> Result<Option<RunRecord>, StoreError>;

    /// Most recent finished run for `source`, any benchmark type
    async fn latest_finished_for_source(
        &self,
        source: &str,
    ) -> Result<Option<RunRecord>, StoreError>;
}
