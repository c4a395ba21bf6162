//! Measurement sources
//!
//! A source diffs the recorded results of two finished runs and returns a
//! human readable regression summary. An empty summary means no regression
//! crossed the threshold.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::identifier::{BenchmarkKind, RunIdentifier};

/// Default regression threshold, in percent
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 10.0;

/// Measurement errors
#[derive(Debug, thiserror::Error)]
pub enum MeasurementError {
    /// One side of the comparison has no recorded results
    #[error("no comparison result for {0}")]
    NoComparisonResult(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for MeasurementError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Diffs the results of two finished runs
#[async_trait]
pub trait MeasurementSource: Send + Sync + 'static {
    /// Compare `current` against `target`, returning a possibly empty summary
    async fn compare(
        &self,
        current: &RunIdentifier,
        target: &RunIdentifier,
    ) -> Result<String, MeasurementError>;
}

/// Measurement sources by benchmark kind
#[derive(Clone)]
pub struct Measurements {
    micro: Arc<dyn MeasurementSource>,
    macro_: Arc<dyn MeasurementSource>,
}

impl Measurements {
    pub fn new(micro: Arc<dyn MeasurementSource>, macro_: Arc<dyn MeasurementSource>) -> Self {
        Self { micro, macro_ }
    }

    /// Postgres sources sharing one pool and threshold
    pub fn postgres(pool: PgPool, threshold_percent: f64) -> Self {
        Self::new(
            Arc::new(PostgresMicroSource::new(pool.clone()).with_threshold_percent(threshold_percent)),
            Arc::new(PostgresMacroSource::new(pool).with_threshold_percent(threshold_percent)),
        )
    }

    pub fn for_kind(&self, kind: &BenchmarkKind) -> &Arc<dyn MeasurementSource> {
        match kind {
            BenchmarkKind::Micro => &self.micro,
            BenchmarkKind::Macro(_) => &self.macro_,
        }
    }
}

/// Micro benchmark results backed by the `microbenchmark` table
///
/// Compares the mean `ns_per_op` of every benchmark function present on
/// both sides.
#[derive(Clone)]
pub struct PostgresMicroSource {
    pool: PgPool,
    threshold_percent: f64,
}

impl PostgresMicroSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
        }
    }

    pub fn with_threshold_percent(mut self, threshold: f64) -> Self {
        self.threshold_percent = threshold;
        self
    }

    async fn results(&self, identifier: &RunIdentifier) -> Result<BTreeMap<String, f64>, MeasurementError> {
        let rows = sqlx::query(
            r#"
            SELECT m.pkg_name, m.name, AVG(m.ns_per_op) AS ns_per_op
            FROM microbenchmark m
            JOIN execution e ON e.id = m.exec_id
            WHERE e.status = 'finished'
              AND e.git_ref = $1
              AND e.source = $2
              AND e.benchmark_type = 'micro'
            GROUP BY m.pkg_name, m.name
            "#,
        )
        .bind(&identifier.git_ref)
        .bind(&identifier.source)
        .fetch_all(&self.pool)
        .await?;

        let mut results = BTreeMap::new();
        for row in rows {
            let pkg: String = row.try_get("pkg_name")?;
            let name: String = row.try_get("name")?;
            let ns_per_op: f64 = row.try_get("ns_per_op")?;
            results.insert(format!("{pkg}.{name}"), ns_per_op);
        }
        Ok(results)
    }
}

#[async_trait]
impl MeasurementSource for PostgresMicroSource {
    #[instrument(skip(self), fields(current = %current.git_ref, target = %target.git_ref))]
    async fn compare(
        &self,
        current: &RunIdentifier,
        target: &RunIdentifier,
    ) -> Result<String, MeasurementError> {
        let current_results = self.results(current).await?;
        let target_results = self.results(target).await?;
        Ok(micro_summary(
            &current_results,
            &target_results,
            self.threshold_percent,
        ))
    }
}

/// Aggregated macro benchmark sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacroSample {
    pub qps: f64,
    pub latency_ms: f64,
}

/// Macro benchmark results backed by the `macrobenchmark` table
///
/// Fails with [`MeasurementError::NoComparisonResult`] when either side
/// has no sample.
#[derive(Clone)]
pub struct PostgresMacroSource {
    pool: PgPool,
    threshold_percent: f64,
}

impl PostgresMacroSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
        }
    }

    pub fn with_threshold_percent(mut self, threshold: f64) -> Self {
        self.threshold_percent = threshold;
        self
    }

    async fn sample(&self, identifier: &RunIdentifier) -> Result<MacroSample, MeasurementError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(m.id) AS samples,
                   AVG(m.qps_total) AS qps,
                   AVG(m.latency_ms) AS latency_ms
            FROM macrobenchmark m
            JOIN execution e ON e.id = m.exec_id
            WHERE e.status = 'finished'
              AND e.git_ref = $1
              AND e.source = $2
              AND e.benchmark_type = $3
              AND e.planner_version = $4
            "#,
        )
        .bind(&identifier.git_ref)
        .bind(&identifier.source)
        .bind(&identifier.benchmark_type)
        .bind(&identifier.planner_version)
        .fetch_one(&self.pool)
        .await?;

        let samples: i64 = row.try_get("samples")?;
        if samples == 0 {
            return Err(MeasurementError::NoComparisonResult(identifier.to_string()));
        }
        Ok(MacroSample {
            qps: row.try_get::<Option<f64>, _>("qps")?.unwrap_or_default(),
            latency_ms: row.try_get::<Option<f64>, _>("latency_ms")?.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl MeasurementSource for PostgresMacroSource {
    #[instrument(skip(self), fields(current = %current.git_ref, target = %target.git_ref))]
    async fn compare(
        &self,
        current: &RunIdentifier,
        target: &RunIdentifier,
    ) -> Result<String, MeasurementError> {
        let current_sample = self.sample(current).await?;
        let target_sample = self.sample(target).await?;
        Ok(macro_summary(
            current_sample,
            target_sample,
            self.threshold_percent,
        ))
    }
}

fn percent_change(current: f64, target: f64) -> Option<f64> {
    if target == 0.0 {
        return None;
    }
    Some((current - target) / target * 100.0)
}

/// Lines for every benchmark whose time per op grew past the threshold
pub fn micro_summary(
    current: &BTreeMap<String, f64>,
    target: &BTreeMap<String, f64>,
    threshold_percent: f64,
) -> String {
    let mut lines = Vec::new();
    for (name, &now) in current {
        let Some(&before) = target.get(name) else {
            continue;
        };
        if let Some(change) = percent_change(now, before) {
            if change > threshold_percent {
                lines.push(format!(
                    "- `{name}`: {before:.2} ns/op -> {now:.2} ns/op (+{change:.1}%)"
                ));
            }
        }
    }
    lines.join("\n")
}

/// Lines for a throughput drop or a latency increase past the threshold
pub fn macro_summary(current: MacroSample, target: MacroSample, threshold_percent: f64) -> String {
    let mut lines = Vec::new();
    if let Some(change) = percent_change(current.qps, target.qps) {
        if -change > threshold_percent {
            lines.push(format!(
                "- QPS: {:.2} -> {:.2} ({change:.1}%)",
                target.qps, current.qps
            ));
        }
    }
    if let Some(change) = percent_change(current.latency_ms, target.latency_ms) {
        if change > threshold_percent {
            lines.push(format!(
                "- Latency: {:.2}ms -> {:.2}ms (+{change:.1}%)",
                target.latency_ms, current.latency_ms
            ));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micro_summary_flags_slowdowns_only() {
        let target = BTreeMap::from([
            ("sqlparser.BenchmarkParse".to_string(), 1000.0),
            ("vtgate.BenchmarkRoute".to_string(), 500.0),
            ("vttablet.BenchmarkPool".to_string(), 200.0),
        ]);
        let current = BTreeMap::from([
            ("sqlparser.BenchmarkParse".to_string(), 1250.0),
            ("vtgate.BenchmarkRoute".to_string(), 400.0),
            ("vttablet.BenchmarkPool".to_string(), 210.0),
            ("new.BenchmarkOnlyHere".to_string(), 9000.0),
        ]);

        let summary = micro_summary(&current, &target, 10.0);
        assert_eq!(
            summary,
            "- `sqlparser.BenchmarkParse`: 1000.00 ns/op -> 1250.00 ns/op (+25.0%)"
        );
    }

    #[test]
    fn test_micro_summary_empty_without_overlap() {
        let current = BTreeMap::from([("a.B".to_string(), 1.0)]);
        assert!(micro_summary(&current, &BTreeMap::new(), 10.0).is_empty());
    }

    #[test]
    fn test_macro_summary() {
        let target = MacroSample {
            qps: 1000.0,
            latency_ms: 10.0,
        };

        let steady = MacroSample {
            qps: 980.0,
            latency_ms: 10.5,
        };
        assert!(macro_summary(steady, target, 10.0).is_empty());

        let regressed = MacroSample {
            qps: 800.0,
            latency_ms: 12.5,
        };
        let summary = macro_summary(regressed, target, 10.0);
        assert!(summary.contains("QPS: 1000.00 -> 800.00 (-20.0%)"));
        assert!(summary.contains("Latency: 10.00ms -> 12.50ms (+25.0%)"));
    }

    #[test]
    fn test_zero_baseline_is_ignored() {
        let target = MacroSample {
            qps: 0.0,
            latency_ms: 0.0,
        };
        let current = MacroSample {
            qps: 10.0,
            latency_ms: 5.0,
        };
        assert!(macro_summary(current, target, 10.0).is_empty());
    }
}
