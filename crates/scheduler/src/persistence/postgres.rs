//! PostgreSQL implementation of RunStore
//!
//! Production persistence for run records. The schema lives in
//! `migrations/` and is applied with [`PostgresRunStore::migrate`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::identifier::RunStatus;

const RUN_COLUMNS: &str = "id, status, source, git_ref, benchmark_type, planner_version, pull_nb, \
                           created_at, started_at, finished_at";

/// PostgreSQL implementation of RunStore
///
/// # Example
///
/// ```ignore
/// use benchrun_scheduler::PostgresRunStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/benchrun").await?;
/// let store = PostgresRunStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn fetch_one_recent(
        &self,
        mut query: QueryBuilder<'_, Postgres>,
    ) -> Result<Option<RunRecord>, StoreError> {
        query.push(" ORDER BY started_at DESC NULLS LAST, created_at DESC LIMIT 1");
        let row = query
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(|r| parse_run_row(&r)).transpose()
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(skip(self, record), fields(run_id = %record.id))]
    async fn insert(&self, record: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution (id, status, source, git_ref, benchmark_type, planner_version, pull_nb, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(&record.source)
        .bind(&record.git_ref)
        .bind(&record.benchmark_type)
        .bind(&record.planner_version)
        .bind(record.pull_nb)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert run: {}", e);
            db_error(e)
        })?;

        debug!(git_ref = %record.git_ref, source = %record.source, "inserted run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = match status {
            RunStatus::Started => {
                sqlx::query("UPDATE execution SET status = $2, started_at = $3 WHERE id = $1")
                    .bind(id)
                    .bind(status.as_str())
                    .bind(at)
            }
            RunStatus::Finished | RunStatus::Failed => {
                sqlx::query("UPDATE execution SET status = $2, finished_at = $3 WHERE id = $1")
                    .bind(id)
                    .bind(status.as_str())
                    .bind(at)
            }
            RunStatus::Created => sqlx::query("UPDATE execution SET status = $2 WHERE id = $1")
                .bind(id)
                .bind(status.as_str()),
        };

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update run status: {}", e);
                db_error(e)
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM execution WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(|r| parse_run_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn exists(&self, filter: &RunFilter, status: RunStatus) -> Result<bool, StoreError> {
        let mut query = QueryBuilder::new("SELECT EXISTS (SELECT 1 FROM execution WHERE status = ");
        query.push_bind(status.as_str());
        push_filter(&mut query, filter);
        query.push(")");

        let row = query
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        row.try_get::<bool, _>(0).map_err(db_error)
    }

    #[instrument(skip(self))]
    async fn find_finished(&self, filter: &RunFilter) -> Result<Option<RunRecord>, StoreError> {
        let mut query = QueryBuilder::new(format!(
            "SELECT {RUN_COLUMNS} FROM execution WHERE status = 'finished'"
        ));
        push_filter(&mut query, filter);
        self.fetch_one_recent(query).await
    }

    #[instrument(skip(self))]
    async fn previous_finished(
        &self,
        source: &str,
        benchmark_type: &str,
        excluding_git_ref: &str,
    ) -> Result<Option<RunRecord>, StoreError> {
        let mut query = QueryBuilder::new(format!(
            "SELECT {RUN_COLUMNS} FROM execution WHERE status = 'finished' AND source = "
        ));
        query.push_bind(source.to_string());
        query.push(" AND benchmark_type = ");
        query.push_bind(benchmark_type.to_string());
        query.push(" AND git_ref <> ");
        query.push_bind(excluding_git_ref.to_string());
        self.fetch_one_recent(query).await
    }

    #[instrument(skip(self))]
    async fn latest_finished_for_source(
        &self,
        source: &str,
    ) -> Result<Option<RunRecord>, StoreError> {
        let mut query = QueryBuilder::new(format!(
            "SELECT {RUN_COLUMNS} FROM execution WHERE status = 'finished' AND source = "
        ));
        query.push_bind(source.to_string());
        self.fetch_one_recent(query).await
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &RunFilter) {
    if let Some(source) = &filter.source {
        query.push(" AND source = ").push_bind(source.clone());
    }
    if let Some(git_ref) = &filter.git_ref {
        query.push(" AND git_ref = ").push_bind(git_ref.clone());
    }
    if let Some(benchmark_type) = &filter.benchmark_type {
        query
            .push(" AND benchmark_type = ")
            .push_bind(benchmark_type.clone());
    }
    if let Some(planner_version) = &filter.planner_version {
        query
            .push(" AND planner_version = ")
            .push_bind(planner_version.clone());
    }
    if let Some(pull_nb) = filter.pull_nb {
        query.push(" AND pull_nb = ").push_bind(pull_nb);
    }
}

fn parse_run_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    Ok(RunRecord {
        id: row.try_get("id").map_err(db_error)?,
        status: status.parse().map_err(StoreError::Serialization)?,
        source: row.try_get("source").map_err(db_error)?,
        git_ref: row.try_get("git_ref").map_err(db_error)?,
        benchmark_type: row.try_get("benchmark_type").map_err(db_error)?,
        planner_version: row.try_get("planner_version").map_err(db_error)?,
        pull_nb: row.try_get("pull_nb").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        started_at: row.try_get("started_at").map_err(db_error)?,
        finished_at: row.try_get("finished_at").map_err(db_error)?,
    })
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
