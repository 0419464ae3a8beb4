//! Relational bookkeeping for attempts, matrices, specs and tests.

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::events::SpecStats;

pub use self::memory::MemoryRunStore;
pub use self::postgres::PgRunStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The insert hit a conflict, yet the row it conflicted with could not
    /// be read back (another writer has not committed it yet).
    #[error("{table} row conflicted on insert but no existing row was found")]
    ConflictRowMissing { table: &'static str },

    #[error("{table} row {id} does not exist")]
    NotFound { table: &'static str, id: i64 },

    #[error("{column} value {value} does not fit an INTEGER column")]
    OutOfRange { column: &'static str, value: u32 },

    #[error("database connection already closed")]
    Closed,

    #[error("run database is unavailable")]
    Unavailable,
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Primary key of an `attempt` row.
    AttemptId
);
row_id!(
    /// Primary key of a `matrix` row.
    MatrixId
);
row_id!(
    /// Primary key of a `specs` row.
    SpecId
);
row_id!(
    /// Primary key of a `tests` row.
    TestId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixStatus {
    Started,
    Done,
}

impl MatrixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecStatus {
    Pass,
    Fail,
}

impl SpecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

/// Values for a new `attempt` row.
#[derive(Debug, Clone, Serialize)]
pub struct NewAttempt {
    pub workflow_id: i64,
    pub attempt: i32,
    pub browser: String,
    pub os: String,
    pub repo: String,
    pub committer: String,
    pub run_type: String,
    pub commit_msg: String,
    pub branch: String,
}

/// Values for a new `matrix` row.
#[derive(Debug, Clone, Serialize)]
pub struct NewMatrix {
    pub workflow_id: i64,
    pub matrix_id: String,
    pub status: MatrixStatus,
    pub attempt_id: AttemptId,
}

/// Aggregates written to a `specs` row once the file finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpecSummary {
    pub test_count: u32,
    pub passes: u32,
    pub failed: u32,
    pub pending: u32,
    pub skipped: u32,
    pub status: SpecStatus,
}

impl SpecSummary {
    pub fn from_stats(stats: &SpecStats) -> Self {
        Self {
            test_count: stats.tests,
            passes: stats.passes,
            failed: stats.failures,
            pending: stats.pending,
            skipped: stats.skipped,
            status: if stats.failures > 0 {
                SpecStatus::Fail
            } else {
                SpecStatus::Pass
            },
        }
    }
}

/// Values for a new `tests` row.
#[derive(Debug, Clone, Serialize)]
pub struct NewTest {
    pub name: String,
    pub spec_id: SpecId,
    pub status: String,
    pub retries: i32,
    /// JSON array of the test's attempts.
    pub retry_data: String,
}

/// Write side of the run bookkeeping.
///
/// Implementations hold a single connection; the recorder calls them one at
/// a time, so methods take `&mut self`.
#[async_trait]
pub trait RunStore: Send {
    /// Insert the attempt, or return the id of the existing row with the
    /// same `(workflowId, attempt)`.
    async fn upsert_attempt(&mut self, attempt: &NewAttempt) -> Result<AttemptId, StoreError>;

    /// Insert the matrix, or return the id of the existing row with the same
    /// `(matrixId, attemptId)`.
    async fn upsert_matrix(&mut self, matrix: &NewMatrix) -> Result<MatrixId, StoreError>;

    async fn insert_spec(&mut self, name: &str, matrix_id: MatrixId) -> Result<SpecId, StoreError>;

    async fn complete_spec(
        &mut self,
        spec_id: SpecId,
        summary: &SpecSummary,
    ) -> Result<(), StoreError>;

    async fn insert_test(&mut self, test: &NewTest) -> Result<TestId, StoreError>;

    async fn finish_matrix(&mut self, matrix_id: MatrixId) -> Result<(), StoreError>;

    async fn finish_attempt(
        &mut self,
        attempt_id: AttemptId,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Release the connection. Later calls fail with [`StoreError::Closed`].
    async fn close(&mut self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_with_failures_is_fail() {
        let stats = SpecStats {
            tests: 5,
            passes: 3,
            failures: 2,
            pending: 0,
            skipped: 0,
        };
        let summary = SpecSummary::from_stats(&stats);
        assert_eq!(summary.status, SpecStatus::Fail);
        assert_eq!(summary.test_count, 5);
        assert_eq!(summary.passes, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.pending, 0);
        assert_eq!(summary.skipped, 0);
    }

    #[test]
    fn test_summary_without_failures_is_pass() {
        let stats = SpecStats {
            tests: 4,
            passes: 2,
            failures: 0,
            pending: 1,
            skipped: 1,
        };
        assert_eq!(SpecSummary::from_stats(&stats).status, SpecStatus::Pass);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(MatrixStatus::Started.as_str(), "started");
        assert_eq!(MatrixStatus::Done.as_str(), "done");
        assert_eq!(SpecStatus::Fail.as_str(), "fail");
    }
}
