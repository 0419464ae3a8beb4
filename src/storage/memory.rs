//! In-process run store used by `--dry-run` and by tests.
//!
//! Enforces the same unique keys as the PostgreSQL schema, so the
//! insert-or-reuse behavior of attempts and matrices is observable without
//! a database.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{
    AttemptId, MatrixId, MatrixStatus, NewAttempt, NewMatrix, NewTest, RunStore, SpecId,
    SpecSummary, StoreError, TestId,
};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRow {
    pub id: AttemptId,
    #[serde(flatten)]
    pub values: NewAttempt,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatrixRow {
    pub id: MatrixId,
    #[serde(flatten)]
    pub values: NewMatrix,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecRow {
    pub id: SpecId,
    pub name: String,
    pub matrix_id: MatrixId,
    pub summary: Option<SpecSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRow {
    pub id: TestId,
    #[serde(flatten)]
    pub values: NewTest,
}

#[derive(Debug, Default, Serialize)]
struct Tables {
    attempts: Vec<AttemptRow>,
    matrices: Vec<MatrixRow>,
    specs: Vec<SpecRow>,
    tests: Vec<TestRow>,
    next_id: i64,
    #[serde(skip)]
    closed: bool,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Cloneable handle; clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A poisoned lock only means a test panicked mid-write; the rows
        // themselves are still consistent.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        let tables = self.lock();
        if tables.closed {
            return Err(StoreError::Closed);
        }
        Ok(tables)
    }

    pub fn attempts(&self) -> Vec<AttemptRow> {
        self.lock().attempts.clone()
    }

    pub fn matrices(&self) -> Vec<MatrixRow> {
        self.lock().matrices.clone()
    }

    pub fn specs(&self) -> Vec<SpecRow> {
        self.lock().specs.clone()
    }

    pub fn tests(&self) -> Vec<TestRow> {
        self.lock().tests.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Snapshot of every table as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&*self.lock()).unwrap_or_default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn upsert_attempt(&mut self, attempt: &NewAttempt) -> Result<AttemptId, StoreError> {
        let mut tables = self.open()?;
        if let Some(existing) = tables
            .attempts
            .iter()
            .find(|r| r.values.workflow_id == attempt.workflow_id && r.values.attempt == attempt.attempt)
        {
            return Ok(existing.id);
        }
        let id = AttemptId(tables.next_id());
        tables.attempts.push(AttemptRow {
            id,
            values: attempt.clone(),
            end_time: None,
        });
        Ok(id)
    }

    async fn upsert_matrix(&mut self, matrix: &NewMatrix) -> Result<MatrixId, StoreError> {
        let mut tables = self.open()?;
        if let Some(existing) = tables
            .matrices
            .iter()
            .find(|r| r.values.matrix_id == matrix.matrix_id && r.values.attempt_id == matrix.attempt_id)
        {
            return Ok(existing.id);
        }
        if !tables.attempts.iter().any(|r| r.id == matrix.attempt_id) {
            return Err(StoreError::NotFound {
                table: "attempt",
                id: matrix.attempt_id.0,
            });
        }
        let id = MatrixId(tables.next_id());
        tables.matrices.push(MatrixRow {
            id,
            values: matrix.clone(),
        });
        Ok(id)
    }

    async fn insert_spec(&mut self, name: &str, matrix_id: MatrixId) -> Result<SpecId, StoreError> {
        let mut tables = self.open()?;
        if !tables.matrices.iter().any(|r| r.id == matrix_id) {
            return Err(StoreError::NotFound {
                table: "matrix",
                id: matrix_id.0,
            });
        }
        let id = SpecId(tables.next_id());
        tables.specs.push(SpecRow {
            id,
            name: name.to_string(),
            matrix_id,
            summary: None,
        });
        Ok(id)
    }

    async fn complete_spec(
        &mut self,
        spec_id: SpecId,
        summary: &SpecSummary,
    ) -> Result<(), StoreError> {
        let mut tables = self.open()?;
        let row = tables
            .specs
            .iter_mut()
            .find(|r| r.id == spec_id)
            .ok_or(StoreError::NotFound {
                table: "specs",
                id: spec_id.0,
            })?;
        row.summary = Some(*summary);
        Ok(())
    }

    async fn insert_test(&mut self, test: &NewTest) -> Result<TestId, StoreError> {
        let mut tables = self.open()?;
        if !tables.specs.iter().any(|r| r.id == test.spec_id) {
            return Err(StoreError::NotFound {
                table: "specs",
                id: test.spec_id.0,
            });
        }
        let id = TestId(tables.next_id());
        tables.tests.push(TestRow {
            id,
            values: test.clone(),
        });
        Ok(id)
    }

    async fn finish_matrix(&mut self, matrix_id: MatrixId) -> Result<(), StoreError> {
        let mut tables = self.open()?;
        let row = tables
            .matrices
            .iter_mut()
            .find(|r| r.id == matrix_id)
            .ok_or(StoreError::NotFound {
                table: "matrix",
                id: matrix_id.0,
            })?;
        row.values.status = MatrixStatus::Done;
        Ok(())
    }

    async fn finish_attempt(
        &mut self,
        attempt_id: AttemptId,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.open()?;
        let row = tables
            .attempts
            .iter_mut()
            .find(|r| r.id == attempt_id)
            .ok_or(StoreError::NotFound {
                table: "attempt",
                id: attempt_id.0,
            })?;
        row.end_time = Some(end_time);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        let mut tables = self.open()?;
        tables.closed = true;
        Ok(())
    }
}
