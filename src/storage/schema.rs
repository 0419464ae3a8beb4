//! Database schema and migrations.

use sqlx::PgConnection;
use tracing::info;

use super::StoreError;

/// DDL for the bookkeeping tables. Every statement is idempotent.
///
/// The two unique constraints are what make concurrent shards converge on a
/// single attempt row and a single matrix row.
pub const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS public.attempt (
        id BIGSERIAL PRIMARY KEY,
        "workflowId" BIGINT NOT NULL,
        attempt INTEGER NOT NULL,
        browser TEXT,
        os TEXT,
        repo TEXT,
        committer TEXT,
        type TEXT,
        "commitMsg" TEXT,
        branch TEXT,
        "startTime" TIMESTAMPTZ NOT NULL DEFAULT now(),
        "endTime" TIMESTAMPTZ,
        UNIQUE ("workflowId", attempt)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS public.matrix (
        id BIGSERIAL PRIMARY KEY,
        "workflowId" BIGINT NOT NULL,
        "matrixId" TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'started',
        "attemptId" BIGINT NOT NULL REFERENCES public.attempt(id),
        UNIQUE ("matrixId", "attemptId")
    )"#,
    r#"CREATE TABLE IF NOT EXISTS public.specs (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        "matrixId" BIGINT NOT NULL REFERENCES public.matrix(id),
        "testCount" INTEGER,
        passes INTEGER,
        failed INTEGER,
        skipped INTEGER,
        pending INTEGER,
        status TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS public.tests (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        "specId" BIGINT NOT NULL REFERENCES public.specs(id),
        status TEXT NOT NULL,
        retries INTEGER NOT NULL,
        "retryData" JSONB NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_matrix_attempt ON public.matrix("attemptId")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_specs_matrix ON public.specs("matrixId")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_tests_spec ON public.tests("specId")"#,
];

/// Run all pending migrations.
pub async fn migrate(conn: &mut PgConnection) -> Result<(), StoreError> {
    for statement in STATEMENTS {
        sqlx::query(*statement).execute(&mut *conn).await?;
    }
    info!(statements = STATEMENTS.len(), "schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> &'static str {
        STATEMENTS
            .iter()
            .find(|s| s.contains(&format!("public.{name} (")))
            .copied()
            .unwrap()
    }

    #[test]
    fn test_attempt_unique_on_workflow_and_attempt() {
        assert!(table("attempt").contains(r#"UNIQUE ("workflowId", attempt)"#));
    }

    #[test]
    fn test_matrix_unique_on_matrix_and_attempt() {
        assert!(table("matrix").contains(r#"UNIQUE ("matrixId", "attemptId")"#));
    }

    #[test]
    fn test_statements_are_idempotent() {
        assert!(STATEMENTS.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
