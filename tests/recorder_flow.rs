//! End-to-end recording against in-memory stores.

use std::path::Path;
use std::time::Duration;

use runledger::artifacts::{screenshot_key, video_key, ArtifactUploader, UploadTasks};
use runledger::config::{EnvResolver, RunIdentity};
use runledger::events::AttemptRecord;
use runledger::recorder::dispatch::replay;
use runledger::recorder::RunRecorder;
use runledger::storage::{MatrixStatus, MemoryRunStore, SpecStatus};

fn identity(runner: &str) -> RunIdentity {
    let env = EnvResolver::from_pairs([
        ("RUNID", "42"),
        ("ATTEMPT_NUMBER", "1"),
        ("REPOSITORY", "acme/builder"),
        ("COMMITTER", "ci-bot"),
        ("TAG", "push"),
        ("BRANCH", "release"),
        ("THIS_RUNNER", runner),
        ("COMMIT_INFO_MESSAGE", "Table: keep \"selected row\" after paging; 'quotes' too"),
    ]);
    RunIdentity::from_env(&env).unwrap()
}

fn recorder(store: &MemoryRunStore, runner: &str) -> RunRecorder<MemoryRunStore> {
    RunRecorder::new(
        identity(runner),
        store.clone(),
        UploadTasks::new(ArtifactUploader::in_memory()),
    )
}

fn session(artifacts: &Path) -> String {
    let shot0 = artifacts.join("filters (failed).png");
    let shot1 = artifacts.join("filters (failed) (attempt 2).png");
    let video = artifacts.join("table.ts.mp4");
    for path in [&shot0, &shot1, &video] {
        std::fs::write(path, b"artifact").unwrap();
    }

    let after_spec = serde_json::json!({
        "event": "after:spec",
        "spec": { "relative": "Widgets/Table/table.ts" },
        "results": {
            "stats": { "tests": 5, "passes": 3, "failures": 2, "pending": 0, "skipped": 0 },
            "tests": [
                { "testId": "r1", "title": ["Table", "sorts"], "state": "passed",
                  "attempts": [{ "state": "passed" }] },
                { "testId": "r2", "title": ["Table", "filters"], "state": "failed",
                  "attempts": [{ "state": "failed" }, { "state": "failed" }] },
                { "testId": "r3", "title": ["Table", "pages"], "state": "passed",
                  "attempts": [{ "state": "failed" }, { "state": "passed" }] }
            ],
            "screenshots": [
                { "path": shot0, "testId": "r2", "testAttemptIndex": 0 },
                { "path": shot1, "testId": "r2", "testAttemptIndex": 1 }
            ],
            "video": video
        }
    });

    [
        r#"{"event":"before:run","details":{"browser":{"name":"chrome"}}}"#.to_string(),
        r#"{"event":"before:spec","spec":{"relative":"Widgets/Table/table.ts"}}"#.to_string(),
        after_spec.to_string(),
        r#"{"event":"after:run"}"#.to_string(),
    ]
    .join("\n")
}

#[tokio::test]
async fn test_full_session_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryRunStore::new();
    let mut rec = recorder(&store, "shard-a");

    let summary = replay(session(dir.path()).as_bytes(), &mut rec).await.unwrap();
    assert!(summary.finished);
    assert_eq!(summary.failed_hooks, 0);
    assert_eq!(rec.drain_uploads(Duration::from_secs(5)).await, 0);

    let attempts = store.attempts();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].end_time.is_some());
    assert!(attempts[0].values.commit_msg.contains("\"selected row\""));
    assert_eq!(store.matrices()[0].values.status, MatrixStatus::Done);

    let specs = store.specs();
    let spec = &specs[0];
    let summary = spec.summary.unwrap();
    assert_eq!(summary.status, SpecStatus::Fail);
    assert_eq!((summary.test_count, summary.passes, summary.failed), (5, 3, 2));

    let tests = store.tests();
    assert_eq!(tests.len(), 3);
    let pages = tests.iter().find(|t| t.values.name == "pages").unwrap();
    assert_eq!(pages.values.retries, 2);
    let history: Vec<AttemptRecord> = serde_json::from_str(&pages.values.retry_data).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_failed());

    let filters = tests.iter().find(|t| t.values.name == "filters").unwrap();
    let mut expected = vec![
        screenshot_key(filters.id, spec.id, 0),
        screenshot_key(filters.id, spec.id, 1),
        video_key(spec.id),
    ];
    assert_eq!(expected[0], format!("{}_{}_1", filters.id, spec.id));
    assert_eq!(expected[1], format!("{}_{}_2", filters.id, spec.id));
    expected.sort();
    assert_eq!(rec.uploads().uploader().list_keys().await.unwrap(), expected);
    assert!(store.is_closed());
}

#[tokio::test]
async fn test_retried_shard_reuses_attempt_and_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryRunStore::new();

    for _ in 0..2 {
        let mut rec = recorder(&store, "shard-a");
        let first_line = session(dir.path()).lines().next().unwrap().to_string();
        replay(first_line.as_bytes(), &mut rec).await.unwrap();
    }
    assert_eq!(store.attempts().len(), 1);
    assert_eq!(store.matrices().len(), 1);

    let mut other_shard = recorder(&store, "shard-b");
    let first_line = session(dir.path()).lines().next().unwrap().to_string();
    replay(first_line.as_bytes(), &mut other_shard).await.unwrap();
    assert_eq!(store.attempts().len(), 1);
    assert_eq!(store.matrices().len(), 2);
    assert_eq!(other_shard.state().attempt_id, Some(store.attempts()[0].id));
}

#[tokio::test]
async fn test_missing_artifacts_do_not_fail_the_spec() {
    let dir = tempfile::tempdir().unwrap();
    let events = session(dir.path());
    std::fs::remove_dir_all(dir.path()).unwrap();

    let store = MemoryRunStore::new();
    let mut rec = recorder(&store, "shard-a");
    let summary = replay(events.as_bytes(), &mut rec).await.unwrap();

    assert_eq!(summary.failed_hooks, 0);
    assert_eq!(rec.drain_uploads(Duration::from_secs(5)).await, 0);
    assert!(rec.uploads().uploader().list_keys().await.unwrap().is_empty());
    assert_eq!(store.tests().len(), 3);
}
