//! The run recorder: mirrors lifecycle hooks into the run store and submits
//! failure artifacts for upload.
//!
//! Hooks are invoked one at a time, in lifecycle order, by a single caller
//! (see [`dispatch`]). Bookkeeping is best-effort: every hook catches its own
//! errors, logs them and returns, so a broken database never changes the
//! outcome of the test run it is recording.

pub mod dispatch;

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::artifacts::{screenshot_key, video_key, UploadTasks};
use crate::config::RunIdentity;
use crate::events::{RunDetails, SpecDescriptor, SpecResults};
use crate::storage::{
    AttemptId, MatrixId, MatrixStatus, NewAttempt, NewMatrix, NewTest, RunStore, SpecId,
    SpecSummary, StoreError,
};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("no attempt row was recorded for this run")]
    MissingAttempt,

    #[error("no matrix row was recorded for this shard")]
    MissingMatrix,

    #[error("no spec row was recorded for {0}")]
    MissingSpec(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to serialize attempt history: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Whether a hook's bookkeeping went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Recorded,
    Failed,
}

/// Spec currently executing.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentSpec {
    pub name: String,
    pub id: SpecId,
}

/// In-memory mirror of what has been written so far.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    pub browser: Option<String>,
    pub attempt_id: Option<AttemptId>,
    pub matrix_id: Option<MatrixId>,
    pub spec: Option<CurrentSpec>,
    pub finished: bool,
}

/// Per-process recorder. Construct once per run; it owns the store
/// connection and the upload queue until `after_run` closes the store.
pub struct RunRecorder<S> {
    identity: RunIdentity,
    state: RunState,
    store: S,
    uploads: UploadTasks,
}

impl<S: RunStore> RunRecorder<S> {
    pub fn new(identity: RunIdentity, store: S, uploads: UploadTasks) -> Self {
        Self {
            identity,
            state: RunState::default(),
            store,
            uploads,
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn uploads(&self) -> &UploadTasks {
        &self.uploads
    }

    /// Give submitted uploads up to `grace` to finish. See
    /// [`UploadTasks::drain`].
    pub async fn drain_uploads(&mut self, grace: Duration) -> usize {
        self.uploads.drain(grace).await
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    /// `before:run`: create (or find) the attempt and this shard's matrix.
    pub async fn before_run(&mut self, details: &RunDetails) -> HookOutcome {
        self.state.browser = Some(details.browser.name.clone());
        let result = self.record_run_start(&details.browser.name).await;
        outcome("before:run", result)
    }

    /// `before:spec`: create the spec row for the file about to run.
    pub async fn before_spec(&mut self, spec: &SpecDescriptor) -> HookOutcome {
        // Never let a failed insert leave the previous spec's id in place.
        self.state.spec = None;
        let result = self.record_spec_start(spec).await;
        outcome("before:spec", result)
    }

    /// `after:spec`: store aggregates and tests, then submit artifacts of
    /// failed tests.
    pub async fn after_spec(&mut self, spec: &SpecDescriptor, results: &SpecResults) -> HookOutcome {
        let result = self.record_spec_end(spec, results).await;
        outcome("after:spec", result)
    }

    /// `after:run`: close out the matrix and attempt, then the connection.
    ///
    /// Each write is attempted independently; the connection is closed last
    /// regardless of whether the writes succeeded.
    pub async fn after_run(&mut self) -> HookOutcome {
        let mut status = HookOutcome::Recorded;

        let finish_matrix = match self.state.matrix_id {
            Some(id) => self
                .store
                .finish_matrix(id)
                .await
                .map_err(RecorderError::from),
            None => Err(RecorderError::MissingMatrix),
        };
        if outcome("after:run", finish_matrix) == HookOutcome::Failed {
            status = HookOutcome::Failed;
        }

        let finish_attempt = match self.state.attempt_id {
            Some(id) => self
                .store
                .finish_attempt(id, Utc::now())
                .await
                .map_err(RecorderError::from),
            None => Err(RecorderError::MissingAttempt),
        };
        if outcome("after:run", finish_attempt) == HookOutcome::Failed {
            status = HookOutcome::Failed;
        }

        let close = self.store.close().await.map_err(RecorderError::from);
        if outcome("after:run", close) == HookOutcome::Failed {
            status = HookOutcome::Failed;
        }

        self.state.finished = true;
        info!(
            matrix_id = %self.identity.matrix_id,
            uploads_in_flight = self.uploads.in_flight(),
            "run finished"
        );
        status
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    async fn record_run_start(&mut self, browser: &str) -> Result<(), RecorderError> {
        let attempt = NewAttempt {
            workflow_id: self.identity.workflow_id,
            attempt: self.identity.attempt,
            browser: browser.to_string(),
            os: self.identity.os.clone(),
            repo: self.identity.repo.clone(),
            committer: self.identity.committer.clone(),
            run_type: self.identity.run_type.clone(),
            commit_msg: self.identity.commit_msg.clone(),
            branch: self.identity.branch.clone(),
        };
        let attempt_id = self.store.upsert_attempt(&attempt).await?;
        self.state.attempt_id = Some(attempt_id);

        let matrix = NewMatrix {
            workflow_id: self.identity.workflow_id,
            matrix_id: self.identity.matrix_id.clone(),
            status: MatrixStatus::Started,
            attempt_id,
        };
        let matrix_id = self.store.upsert_matrix(&matrix).await?;
        self.state.matrix_id = Some(matrix_id);

        info!(
            workflow_id = self.identity.workflow_id,
            attempt = self.identity.attempt,
            %attempt_id,
            %matrix_id,
            "run recorded"
        );
        Ok(())
    }

    async fn record_spec_start(&mut self, spec: &SpecDescriptor) -> Result<(), RecorderError> {
        let matrix_id = self.state.matrix_id.ok_or(RecorderError::MissingMatrix)?;
        let id = self.store.insert_spec(&spec.relative, matrix_id).await?;
        self.state.spec = Some(CurrentSpec {
            name: spec.relative.clone(),
            id,
        });
        info!(spec = %spec.relative, spec_id = %id, "spec started");
        Ok(())
    }

    async fn record_spec_end(
        &mut self,
        spec: &SpecDescriptor,
        results: &SpecResults,
    ) -> Result<(), RecorderError> {
        let current = self
            .state
            .spec
            .as_ref()
            .ok_or_else(|| RecorderError::MissingSpec(spec.relative.clone()))?;
        if current.name != spec.relative {
            warn!(
                started = %current.name,
                finished = %spec.relative,
                "after:spec does not match the spec that was started"
            );
        }
        let spec_id = current.id;

        let summary = SpecSummary::from_stats(&results.stats);
        self.store.complete_spec(spec_id, &summary).await?;

        for test in &results.tests {
            let row = NewTest {
                name: test.display_name().to_string(),
                spec_id,
                status: test.state.clone(),
                retries: i32::try_from(test.attempts.len()).unwrap_or(i32::MAX),
                retry_data: serde_json::to_string(&test.attempts)?,
            };
            let test_id = self.store.insert_test(&row).await?;

            if !test.has_failed_attempt() {
                continue;
            }
            let mut shots = results.screenshots_for(&test.test_id).peekable();
            if shots.peek().is_some() {
                info!(test = %row.name, %test_id, "uploading screenshots");
            }
            for shot in shots {
                self.uploads.submit(
                    "screenshot",
                    shot.path.clone(),
                    screenshot_key(test_id, spec_id, shot.test_attempt_index),
                );
            }
        }

        if results.has_failed_attempt() {
            if let Some(video) = &results.video {
                info!(%spec_id, "uploading video");
                self.uploads.submit("video", video.clone(), video_key(spec_id));
            }
        }

        info!(
            spec = %spec.relative,
            %spec_id,
            status = summary.status.as_str(),
            tests = summary.test_count,
            failed = summary.failed,
            "spec recorded"
        );
        Ok(())
    }
}

fn outcome(hook: &'static str, result: Result<(), RecorderError>) -> HookOutcome {
    match result {
        Ok(()) => HookOutcome::Recorded,
        Err(e) => {
            error!(hook, error = %e, "run bookkeeping failed");
            HookOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactUploader;
    use crate::events::{AttemptRecord, Browser, Screenshot, SpecStats, TestResult};
    use crate::storage::{MemoryRunStore, SpecStatus, TestId};
    use async_trait::async_trait;
    use chrono::DateTime;
    use object_store::path::Path as ObjectPath;

    /// Store whose upserts hit a conflict row that cannot be read back.
    /// Everything else is delegated to a memory store.
    struct UnreadableConflict {
        inner: MemoryRunStore,
        attempt_conflicts: bool,
    }

    #[async_trait]
    impl RunStore for UnreadableConflict {
        async fn upsert_attempt(&mut self, attempt: &NewAttempt) -> Result<AttemptId, StoreError> {
            if self.attempt_conflicts {
                return Err(StoreError::ConflictRowMissing { table: "attempt" });
            }
            self.inner.upsert_attempt(attempt).await
        }

        async fn upsert_matrix(&mut self, _matrix: &NewMatrix) -> Result<MatrixId, StoreError> {
            Err(StoreError::ConflictRowMissing { table: "matrix" })
        }

        async fn insert_spec(&mut self, name: &str, matrix_id: MatrixId) -> Result<SpecId, StoreError> {
            self.inner.insert_spec(name, matrix_id).await
        }

        async fn complete_spec(
            &mut self,
            spec_id: SpecId,
            summary: &SpecSummary,
        ) -> Result<(), StoreError> {
            self.inner.complete_spec(spec_id, summary).await
        }

        async fn insert_test(&mut self, test: &NewTest) -> Result<TestId, StoreError> {
            self.inner.insert_test(test).await
        }

        async fn finish_matrix(&mut self, matrix_id: MatrixId) -> Result<(), StoreError> {
            self.inner.finish_matrix(matrix_id).await
        }

        async fn finish_attempt(
            &mut self,
            attempt_id: AttemptId,
            end_time: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.finish_attempt(attempt_id, end_time).await
        }

        async fn close(&mut self) -> Result<(), StoreError> {
            self.inner.close().await
        }
    }

    fn identity() -> RunIdentity {
        RunIdentity {
            workflow_id: 42,
            attempt: 1,
            matrix_id: "shard-a".into(),
            os: "Linux".into(),
            repo: "acme/builder".into(),
            committer: "ci-bot".into(),
            run_type: "push".into(),
            branch: "release".into(),
            commit_msg: "Cypress test".into(),
        }
    }

    fn recorder(store: &MemoryRunStore) -> RunRecorder<MemoryRunStore> {
        RunRecorder::new(
            identity(),
            store.clone(),
            UploadTasks::new(ArtifactUploader::in_memory()),
        )
    }

    fn chrome() -> RunDetails {
        RunDetails {
            browser: Browser {
                name: "chrome".into(),
            },
        }
    }

    fn spec(name: &str) -> SpecDescriptor {
        SpecDescriptor {
            relative: name.into(),
        }
    }

    fn test_result(id: &str, title: &str, attempts: &[&str]) -> TestResult {
        let state = attempts.last().copied().unwrap_or("pending");
        TestResult {
            test_id: id.into(),
            title: vec!["Table widget".into(), title.into()],
            state: state.into(),
            attempts: attempts.iter().map(|s| AttemptRecord::new(*s)).collect(),
        }
    }

    #[tokio::test]
    async fn test_before_run_twice_reuses_attempt_and_matrix() {
        let store = MemoryRunStore::new();

        let mut first = recorder(&store);
        assert_eq!(first.before_run(&chrome()).await, HookOutcome::Recorded);
        let mut retry = recorder(&store);
        assert_eq!(retry.before_run(&chrome()).await, HookOutcome::Recorded);

        assert_eq!(store.attempts().len(), 1);
        assert_eq!(store.matrices().len(), 1);
        assert_eq!(first.state().attempt_id, retry.state().attempt_id);
        assert_eq!(first.state().matrix_id, retry.state().matrix_id);
        assert_eq!(store.attempts()[0].values.browser, "chrome");
    }

    #[tokio::test]
    async fn test_after_spec_persists_aggregates_and_retries() {
        let store = MemoryRunStore::new();
        let mut rec = recorder(&store);
        rec.before_run(&chrome()).await;
        rec.before_spec(&spec("table/paging.ts")).await;

        let results = SpecResults {
            stats: SpecStats {
                tests: 5,
                passes: 3,
                failures: 2,
                pending: 0,
                skipped: 0,
            },
            tests: vec![test_result("r1", "pages forward", &["failed", "passed"])],
            screenshots: vec![],
            video: None,
        };
        assert_eq!(
            rec.after_spec(&spec("table/paging.ts"), &results).await,
            HookOutcome::Recorded
        );

        let specs = store.specs();
        let summary = specs[0].summary.unwrap();
        assert_eq!(summary.status, SpecStatus::Fail);
        assert_eq!(
            (summary.test_count, summary.passes, summary.failed, summary.pending, summary.skipped),
            (5, 3, 2, 0, 0)
        );

        let tests = store.tests();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].values.name, "pages forward");
        assert_eq!(tests[0].values.retries, 2);
        let history: Vec<AttemptRecord> = serde_json::from_str(&tests[0].values.retry_data).unwrap();
        assert_eq!(history, vec![AttemptRecord::new("failed"), AttemptRecord::new("passed")]);
    }

    #[tokio::test]
    async fn test_failed_test_screenshots_and_video_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let shot = |n: u32| {
            let path = dir.path().join(format!("shot-{n}.png"));
            std::fs::write(&path, b"png").unwrap();
            Screenshot {
                path,
                test_id: "r2".into(),
                test_attempt_index: n,
            }
        };
        let video = dir.path().join("paging.mp4");
        std::fs::write(&video, b"mp4").unwrap();

        let store = MemoryRunStore::new();
        let mut rec = recorder(&store);
        rec.before_run(&chrome()).await;
        rec.before_spec(&spec("table/paging.ts")).await;

        let results = SpecResults {
            stats: SpecStats {
                tests: 2,
                passes: 1,
                failures: 1,
                ..Default::default()
            },
            tests: vec![
                test_result("r1", "sorts", &["passed"]),
                test_result("r2", "filters", &["failed", "failed"]),
            ],
            screenshots: vec![shot(0), shot(1)],
            video: Some(video),
        };
        rec.after_spec(&spec("table/paging.ts"), &results).await;
        assert_eq!(rec.drain_uploads(Duration::from_secs(5)).await, 0);

        let spec_id = store.specs()[0].id;
        let failing: TestId = store
            .tests()
            .iter()
            .find(|t| t.values.name == "filters")
            .unwrap()
            .id;
        let objects = rec.uploads().uploader().store();
        for key in [
            screenshot_key(failing, spec_id, 0),
            screenshot_key(failing, spec_id, 1),
            video_key(spec_id),
        ] {
            assert!(objects.head(&ObjectPath::from(key.clone())).await.is_ok(), "{key}");
        }
        assert_eq!(screenshot_key(failing, spec_id, 1), format!("{failing}_{spec_id}_2"));
    }

    #[tokio::test]
    async fn test_passing_spec_uploads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("ok.mp4");
        std::fs::write(&video, b"mp4").unwrap();

        let store = MemoryRunStore::new();
        let mut rec = recorder(&store);
        rec.before_run(&chrome()).await;
        rec.before_spec(&spec("form/submit.ts")).await;
        let results = SpecResults {
            stats: SpecStats {
                tests: 1,
                passes: 1,
                ..Default::default()
            },
            tests: vec![test_result("r1", "submits", &["passed"])],
            screenshots: vec![],
            video: Some(video),
        };
        rec.after_spec(&spec("form/submit.ts"), &results).await;
        rec.drain_uploads(Duration::from_secs(5)).await;

        let spec_id = store.specs()[0].id;
        let objects = rec.uploads().uploader().store();
        assert!(objects.head(&ObjectPath::from(video_key(spec_id))).await.is_err());
        assert_eq!(store.specs()[0].summary.unwrap().status, SpecStatus::Pass);
    }

    #[tokio::test]
    async fn test_hooks_tolerate_missing_run_start() {
        let store = MemoryRunStore::new();
        let mut rec = recorder(&store);
        store.clone().close().await.unwrap();

        assert_eq!(rec.before_run(&chrome()).await, HookOutcome::Failed);
        assert_eq!(rec.before_spec(&spec("a.ts")).await, HookOutcome::Failed);
        assert_eq!(
            rec.after_spec(&spec("a.ts"), &SpecResults::default()).await,
            HookOutcome::Failed
        );
        assert_eq!(rec.after_run().await, HookOutcome::Failed);
        assert!(rec.state().finished);
        assert!(store.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_failed_spec_start_does_not_reuse_previous_spec() {
        let store = MemoryRunStore::new();
        let mut rec = recorder(&store);
        rec.before_run(&chrome()).await;
        rec.before_spec(&spec("first.ts")).await;
        rec.after_spec(&spec("first.ts"), &SpecResults::default()).await;

        rec.state.matrix_id = None;
        assert_eq!(rec.before_spec(&spec("second.ts")).await, HookOutcome::Failed);
        assert_eq!(
            rec.after_spec(&spec("second.ts"), &SpecResults::default()).await,
            HookOutcome::Failed
        );
        assert_eq!(store.specs().len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_attempt_conflict_fails_hook_and_run_continues() {
        let inner = MemoryRunStore::new();
        let store = UnreadableConflict {
            inner: inner.clone(),
            attempt_conflicts: true,
        };
        let mut rec = RunRecorder::new(
            identity(),
            store,
            UploadTasks::new(ArtifactUploader::in_memory()),
        );

        assert_eq!(rec.before_run(&chrome()).await, HookOutcome::Failed);
        assert_eq!(rec.state().attempt_id, None);
        assert_eq!(rec.state().matrix_id, None);
        assert_eq!(rec.state().browser.as_deref(), Some("chrome"));

        assert_eq!(rec.before_spec(&spec("a.ts")).await, HookOutcome::Failed);
        assert_eq!(
            rec.after_spec(&spec("a.ts"), &SpecResults::default()).await,
            HookOutcome::Failed
        );
        assert_eq!(rec.after_run().await, HookOutcome::Failed);
        assert!(rec.state().finished);
        assert!(inner.is_closed());
    }

    #[tokio::test]
    async fn test_unreadable_matrix_conflict_keeps_attempt() {
        let inner = MemoryRunStore::new();
        let store = UnreadableConflict {
            inner: inner.clone(),
            attempt_conflicts: false,
        };
        let mut rec = RunRecorder::new(
            identity(),
            store,
            UploadTasks::new(ArtifactUploader::in_memory()),
        );

        assert_eq!(rec.before_run(&chrome()).await, HookOutcome::Failed);
        assert_eq!(rec.state().attempt_id, Some(inner.attempts()[0].id));
        assert_eq!(rec.state().matrix_id, None);

        assert_eq!(rec.before_spec(&spec("a.ts")).await, HookOutcome::Failed);
        assert!(inner.specs().is_empty());

        // The attempt is still closed out; only the matrix step fails.
        assert_eq!(rec.after_run().await, HookOutcome::Failed);
        assert!(inner.attempts()[0].end_time.is_some());
        assert!(inner.is_closed());
    }

    #[tokio::test]
    async fn test_after_run_finishes_rows_and_closes() {
        let store = MemoryRunStore::new();
        let mut rec = recorder(&store);
        rec.before_run(&chrome()).await;
        assert_eq!(rec.after_run().await, HookOutcome::Recorded);

        assert_eq!(store.matrices()[0].values.status, MatrixStatus::Done);
        assert!(store.attempts()[0].end_time.is_some());
        assert!(store.is_closed());
    }
}
