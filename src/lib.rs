//! runledger -- records end-to-end test runs for CI dashboards.
//!
//! The test engine's lifecycle hooks (`before:run`, `before:spec`,
//! `after:spec`, `after:run`) arrive as a stream of JSON events. Each one is
//! mirrored into PostgreSQL (attempt, matrix shard, spec and test rows), and
//! screenshots and videos of failed tests are uploaded to S3.

pub mod artifacts;
pub mod config;
pub mod events;
pub mod recorder;
pub mod storage;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufRead, BufReader};

use crate::artifacts::{ArtifactUploader, UploadTasks};
use crate::config::{DbSettings, EnvResolver, RecorderConfig, RunIdentity, Settings};
use crate::recorder::dispatch::{self, ReplaySummary};
use crate::recorder::{RunRecorder, RunState};
use crate::storage::{MemoryRunStore, PgRunStore};

/// Record one shard's run: events from `events` (stdin when `None`) into
/// PostgreSQL and S3.
///
/// Configuration errors are returned before any connection is attempted.
/// Once recording starts, database and upload failures are only logged.
pub async fn record(
    env: &EnvResolver,
    cfg: &RecorderConfig,
    events: Option<&Path>,
) -> Result<ReplaySummary> {
    // 1. Resolve every mandatory value up front
    let settings = Settings::resolve(env, cfg)?;
    let uploader = ArtifactUploader::s3(&settings.storage, &cfg.artifacts)
        .context("failed to configure artifact bucket")?;
    let input = open_events(events).await?;

    // 2. Connect; an unreachable database must not stop the run
    let store = match PgRunStore::connect(&settings.database).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "run database unreachable, hooks will not be recorded");
            PgRunStore::unavailable()
        }
    };

    // 3. Replay hooks
    let mut recorder = RunRecorder::new(settings.identity, store, UploadTasks::new(uploader));
    let summary = dispatch::replay(input, &mut recorder)
        .await
        .context("failed to read hook events")?;

    // 4. Give in-flight uploads a bounded chance to land
    recorder
        .drain_uploads(Duration::from_secs(cfg.artifacts.upload_grace_secs))
        .await;

    tracing::info!(?summary, "recording finished");
    Ok(summary)
}

/// What a dry run would have written.
#[derive(Debug, Serialize)]
pub struct DryRunReport {
    pub identity: RunIdentity,
    pub summary: ReplaySummary,
    pub state: RunState,
    pub tables: serde_json::Value,
    pub artifacts: Vec<String>,
}

/// Replay events against in-memory stores. Only the run identity variables
/// are required; no database or bucket credentials are read.
pub async fn record_dry_run(
    env: &EnvResolver,
    cfg: &RecorderConfig,
    events: Option<&Path>,
) -> Result<DryRunReport> {
    let identity = RunIdentity::from_env(env)?;
    let input = open_events(events).await?;

    let store = MemoryRunStore::new();
    let uploads = UploadTasks::new(ArtifactUploader::in_memory());
    let mut recorder = RunRecorder::new(identity.clone(), store.clone(), uploads);

    let summary = dispatch::replay(input, &mut recorder)
        .await
        .context("failed to read hook events")?;
    recorder
        .drain_uploads(Duration::from_secs(cfg.artifacts.upload_grace_secs))
        .await;

    let artifacts = recorder
        .uploads()
        .uploader()
        .list_keys()
        .await
        .context("failed to list dry-run artifacts")?;

    Ok(DryRunReport {
        identity,
        summary,
        state: recorder.state().clone(),
        tables: store.to_json(),
        artifacts,
    })
}

/// Create the bookkeeping tables if they do not exist.
pub async fn migrate(env: &EnvResolver, cfg: &RecorderConfig) -> Result<()> {
    let settings = DbSettings::from_env(env, &cfg.database)?;
    let mut store = PgRunStore::connect(&settings)
        .await
        .context("failed to connect to run database")?;
    store.migrate().await.context("failed to apply schema")?;
    storage::RunStore::close(&mut store)
        .await
        .context("failed to close run database connection")?;
    Ok(())
}

async fn open_events(path: Option<&Path>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    Ok(match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open event stream: {}", path.display()))?;
            tracing::info!(path = %path.display(), "reading hook events from file");
            Box::new(BufReader::new(file))
        }
        None => {
            tracing::info!("reading hook events from stdin");
            Box::new(BufReader::new(tokio::io::stdin()))
        }
    })
}
