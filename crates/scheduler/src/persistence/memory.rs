//! In-memory implementation of RunStore for testing and dev mode

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::identifier::RunStatus;

/// In-memory implementation of RunStore
///
/// Stores all records in memory and provides the same semantics as the
/// PostgreSQL implementation. Data is lost on restart.
///
/// # Example
///
/// ```
/// use benchrun_scheduler::InMemoryRunStore;
///
/// let store = InMemoryRunStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, RunRecord>>,
}

impl InMemoryRunStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Snapshot of every record, ordered by creation time
    pub fn records(&self) -> Vec<RunRecord> {
        let mut records: Vec<_> = self.runs.read().values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.runs.write().clear();
    }

    fn most_recent<F>(&self, predicate: F) -> Option<RunRecord>
    where
        F: Fn(&RunRecord) -> bool,
    {
        self.runs
            .read()
            .values()
            .filter(|r| predicate(r))
            .max_by_key(|r| (r.started_at, r.created_at, r.id))
            .cloned()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, record: &RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&record.id) {
            return Err(StoreError::Database(format!(
                "duplicate run id: {}",
                record.id
            )));
        }
        runs.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        record.status = status;
        match status {
            RunStatus::Started => record.started_at = Some(at),
            RunStatus::Finished | RunStatus::Failed => record.finished_at = Some(at),
            RunStatus::Created => {}
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.runs.read().get(&id).cloned())
    }

    async fn exists(&self, filter: &RunFilter, status: RunStatus) -> Result<bool, StoreError> {
        Ok(self
            .runs
            .read()
            .values()
            .any(|r| r.status == status && filter.matches(r)))
    }

    async fn find_finished(&self, filter: &RunFilter) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.most_recent(|r| r.status == RunStatus::Finished && filter.matches(r)))
    }

    async fn previous_finished(
        &self,
        source: &str,
        benchmark_type: &str,
        excluding_git_ref: &str,
    ) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.most_recent(|r| {
            r.status == RunStatus::Finished
                && r.source == source
                && r.benchmark_type == benchmark_type
                && r.git_ref != excluding_git_ref
        }))
    }

    async fn latest_finished_for_source(
        &self,
        source: &str,
    ) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.most_recent(|r| r.status == RunStatus::Finished && r.source == source))
    }
}
