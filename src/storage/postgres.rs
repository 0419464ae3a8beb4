//! PostgreSQL gateway over a single long-lived connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection as _, PgConnection};
use tracing::{debug, info, instrument};

use super::{
    schema, AttemptId, MatrixId, MatrixStatus, NewAttempt, NewMatrix, NewTest, RunStore, SpecId,
    SpecSummary, StoreError, TestId,
};
use crate::config::DbSettings;

/// Run bookkeeping backed by PostgreSQL.
///
/// Holds exactly one connection for the lifetime of the recording session.
#[derive(Debug)]
pub struct PgRunStore {
    conn: Option<PgConnection>,
    closed: bool,
}

impl PgRunStore {
    /// Open the connection. Credentials are already resolved, so this is the
    /// first point at which the network is touched.
    #[instrument(skip_all, fields(host = %settings.host, database = %settings.database), err)]
    pub async fn connect(settings: &DbSettings) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.database)
            .ssl_mode(ssl_mode(settings));

        let conn = PgConnection::connect_with(&options).await?;
        info!("connected to run database");
        Ok(Self {
            conn: Some(conn),
            closed: false,
        })
    }

    /// A store whose connection could not be opened. Every call fails with
    /// [`StoreError::Unavailable`], which the recorder logs per hook.
    pub fn unavailable() -> Self {
        Self {
            conn: None,
            closed: false,
        }
    }

    /// Apply the schema on the held connection.
    pub async fn migrate(&mut self) -> Result<(), StoreError> {
        schema::migrate(self.conn()?).await
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None if self.closed => Err(StoreError::Closed),
            None => Err(StoreError::Unavailable),
        }
    }
}

fn ssl_mode(settings: &DbSettings) -> PgSslMode {
    match (settings.require_tls, settings.verify_tls) {
        (true, true) => PgSslMode::VerifyFull,
        (true, false) => PgSslMode::Require,
        (false, _) => PgSslMode::Prefer,
    }
}

/// INTEGER columns hold at most `i32::MAX`.
fn column_count(column: &'static str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}

#[async_trait]
impl RunStore for PgRunStore {
    #[instrument(skip_all, fields(workflow_id = attempt.workflow_id, attempt = attempt.attempt), err)]
    async fn upsert_attempt(&mut self, attempt: &NewAttempt) -> Result<AttemptId, StoreError> {
        let conn = self.conn()?;
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"INSERT INTO public.attempt ("workflowId", "attempt", "browser", "os", "repo", "committer", "type", "commitMsg", "branch")
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT ("workflowId", attempt) DO NOTHING
               RETURNING id"#,
        )
        .bind(attempt.workflow_id)
        .bind(attempt.attempt)
        .bind(&attempt.browser)
        .bind(&attempt.os)
        .bind(&attempt.repo)
        .bind(&attempt.committer)
        .bind(&attempt.run_type)
        .bind(&attempt.commit_msg)
        .bind(&attempt.branch)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(id) = inserted {
            return Ok(AttemptId(id));
        }

        debug!("attempt already recorded, reusing existing row");
        let existing: Option<i64> = sqlx::query_scalar(
            r#"SELECT id FROM public.attempt WHERE "workflowId" = $1 AND attempt = $2"#,
        )
        .bind(attempt.workflow_id)
        .bind(attempt.attempt)
        .fetch_optional(&mut *conn)
        .await?;

        existing
            .map(AttemptId)
            .ok_or(StoreError::ConflictRowMissing { table: "attempt" })
    }

    #[instrument(skip_all, fields(matrix_id = %matrix.matrix_id, attempt_id = %matrix.attempt_id), err)]
    async fn upsert_matrix(&mut self, matrix: &NewMatrix) -> Result<MatrixId, StoreError> {
        let conn = self.conn()?;
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"INSERT INTO public.matrix ("workflowId", "matrixId", "status", "attemptId")
               VALUES ($1, $2, $3, $4)
               ON CONFLICT ("matrixId", "attemptId") DO NOTHING
               RETURNING id"#,
        )
        .bind(matrix.workflow_id)
        .bind(&matrix.matrix_id)
        .bind(matrix.status.as_str())
        .bind(matrix.attempt_id.0)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(id) = inserted {
            return Ok(MatrixId(id));
        }

        debug!("matrix already recorded, reusing existing row");
        let existing: Option<i64> = sqlx::query_scalar(
            r#"SELECT id FROM public.matrix WHERE "matrixId" = $1 AND "attemptId" = $2"#,
        )
        .bind(&matrix.matrix_id)
        .bind(matrix.attempt_id.0)
        .fetch_optional(&mut *conn)
        .await?;

        existing
            .map(MatrixId)
            .ok_or(StoreError::ConflictRowMissing { table: "matrix" })
    }

    async fn insert_spec(&mut self, name: &str, matrix_id: MatrixId) -> Result<SpecId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO public.specs ("name", "matrixId") VALUES ($1, $2) RETURNING id"#,
        )
        .bind(name)
        .bind(matrix_id.0)
        .fetch_one(self.conn()?)
        .await?;

        Ok(SpecId(id))
    }

    async fn complete_spec(
        &mut self,
        spec_id: SpecId,
        summary: &SpecSummary,
    ) -> Result<(), StoreError> {
        let test_count = column_count("testCount", summary.test_count)?;
        let passes = column_count("passes", summary.passes)?;
        let failed = column_count("failed", summary.failed)?;
        let skipped = column_count("skipped", summary.skipped)?;
        let pending = column_count("pending", summary.pending)?;

        sqlx::query(
            r#"UPDATE public.specs
               SET "testCount" = $1, "passes" = $2, "failed" = $3, "skipped" = $4, "pending" = $5, "status" = $6
               WHERE id = $7"#,
        )
        .bind(test_count)
        .bind(passes)
        .bind(failed)
        .bind(skipped)
        .bind(pending)
        .bind(summary.status.as_str())
        .bind(spec_id.0)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn insert_test(&mut self, test: &NewTest) -> Result<TestId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO public.tests ("name", "specId", "status", "retries", "retryData")
               VALUES ($1, $2, $3, $4, $5::jsonb)
               RETURNING id"#,
        )
        .bind(&test.name)
        .bind(test.spec_id.0)
        .bind(&test.status)
        .bind(test.retries)
        .bind(&test.retry_data)
        .fetch_one(self.conn()?)
        .await?;

        Ok(TestId(id))
    }

    async fn finish_matrix(&mut self, matrix_id: MatrixId) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE public.matrix SET "status" = $1 WHERE id = $2"#)
            .bind(MatrixStatus::Done.as_str())
            .bind(matrix_id.0)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn finish_attempt(
        &mut self,
        attempt_id: AttemptId,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE public.attempt SET "endTime" = $1 WHERE "id" = $2"#)
            .bind(end_time)
            .bind(attempt_id.0)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.conn()?;
        let Some(conn) = self.conn.take() else {
            return Err(StoreError::Closed);
        };
        self.closed = true;
        conn.close().await?;
        info!("run database connection closed");
        Ok(())
    }
}
