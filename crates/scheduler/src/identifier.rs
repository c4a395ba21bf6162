//! Run identifiers and statuses
//!
//! A [`RunIdentifier`] names one logical benchmark intent. Two requests with
//! identical identifiers must never execute concurrently or redundantly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length of a shortened git reference (as shown in notifications and tags)
pub const SHORT_REF_LEN: usize = 7;

/// Shorten a git SHA to [`SHORT_REF_LEN`] characters.
///
/// References that are not hexadecimal SHAs (tags, branches) are returned
/// unchanged.
pub fn shorten_ref(git_ref: &str) -> &str {
    let is_sha = git_ref.len() > SHORT_REF_LEN && git_ref.chars().all(|c| c.is_ascii_hexdigit());
    if is_sha {
        &git_ref[..SHORT_REF_LEN]
    } else {
        git_ref
    }
}

/// Composite key distinguishing one benchmark intent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentifier {
    /// Trigger name (e.g. "cron", "pull_request")
    pub source: String,
    /// Commit SHA or tag the benchmark runs against
    pub git_ref: String,
    /// Benchmark type (e.g. "micro", "oltp", "tpcc")
    pub benchmark_type: String,
    /// Query planner version, empty when not applicable
    #[serde(default)]
    pub planner_version: String,
    /// Pull request number, 0 when the run is not tied to a pull request
    #[serde(default)]
    pub pull_nb: i32,
}

impl RunIdentifier {
    /// Create an identifier with no planner version and no pull request
    pub fn new(
        source: impl Into<String>,
        git_ref: impl Into<String>,
        benchmark_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            git_ref: git_ref.into(),
            benchmark_type: benchmark_type.into(),
            planner_version: String::new(),
            pull_nb: 0,
        }
    }

    /// Set the planner version
    pub fn with_planner_version(mut self, version: impl Into<String>) -> Self {
        self.planner_version = version.into();
        self
    }

    /// Set the pull request number
    pub fn with_pull_nb(mut self, pull_nb: i32) -> Self {
        self.pull_nb = pull_nb;
        self
    }

    /// Benchmark kind derived from `benchmark_type`
    pub fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::from(self.benchmark_type.as_str())
    }

    /// Shortened git reference
    pub fn short_ref(&self) -> &str {
        shorten_ref(&self.git_ref)
    }
}

impl fmt::Display for RunIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.source,
            self.short_ref(),
            self.benchmark_type
        )?;
        if !self.planner_version.is_empty() {
            write!(f, " planner={}", self.planner_version)?;
        }
        if self.pull_nb > 0 {
            write!(f, " pr=#{}", self.pull_nb)?;
        }
        Ok(())
    }
}

/// Family of a benchmark type
///
/// Micro benchmarks do not depend on the query planner, so their store
/// lookups ignore the planner version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BenchmarkKind {
    Micro,
    Macro(String),
}

impl BenchmarkKind {
    pub const MICRO: &'static str = "micro";

    pub fn is_micro(&self) -> bool {
        matches!(self, Self::Micro)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Micro => Self::MICRO,
            Self::Macro(name) => name,
        }
    }
}

impl From<&str> for BenchmarkKind {
    fn from(value: &str) -> Self {
        let lower = value.trim().to_ascii_lowercase();
        if lower == Self::MICRO {
            Self::Micro
        } else {
            Self::Macro(lower)
        }
    }
}

/// Status of a run in the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Record inserted, execution not started
    Created,
    /// Execution in progress
    Started,
    /// Execution completed successfully
    Finished,
    /// Execution failed or timed out
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shorten_ref() {
        assert_eq!(shorten_ref("abc123def4567890"), "abc123d");
        assert_eq!(shorten_ref("v15.0.0"), "v15.0.0");
        assert_eq!(shorten_ref("abc12"), "abc12");
    }

    #[test]
    fn test_identical_identifiers_collide() {
        let a = RunIdentifier::new("pr", "abc123", "micro").with_pull_nb(42);
        let b = RunIdentifier::new("pr", "abc123", "micro").with_pull_nb(42);
        let c = RunIdentifier::new("pr", "abc123", "micro").with_pull_nb(43);

        let mut set = HashSet::new();
        assert!(set.insert(a));
        assert!(!set.insert(b));
        assert!(set.insert(c));
    }

    #[test]
    fn test_benchmark_kind() {
        assert_eq!(BenchmarkKind::from("micro"), BenchmarkKind::Micro);
        assert_eq!(BenchmarkKind::from("MICRO"), BenchmarkKind::Micro);
        assert_eq!(
            BenchmarkKind::from("oltp"),
            BenchmarkKind::Macro("oltp".to_string())
        );
        assert_eq!(BenchmarkKind::from("tpcc").as_str(), "tpcc");
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Created,
            RunStatus::Started,
            RunStatus::Finished,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("running".parse::<RunStatus>().is_err());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Started.is_terminal());
    }

    #[test]
    fn test_display() {
        let id = RunIdentifier::new("cron", "0123456789abcdef", "oltp")
            .with_planner_version("Gen4")
            .with_pull_nb(7);
        assert_eq!(id.to_string(), "cron@0123456 (oltp) planner=Gen4 pr=#7");
    }
}
