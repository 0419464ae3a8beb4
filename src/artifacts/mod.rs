//! Failure artifact uploads (screenshots, videos) to object storage.
//!
//! Uploads never gate the run: [`UploadTasks::submit`] detaches each one onto
//! the runtime and routes failures to the log.

pub mod keys;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ArtifactConfig, S3Settings};

pub use self::keys::{screenshot_key, video_key};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read artifact {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("object store rejected {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: object_store::Error,
    },
}

/// Puts local files into the artifact bucket.
#[derive(Debug, Clone)]
pub struct ArtifactUploader {
    store: Arc<dyn ObjectStore>,
}

impl ArtifactUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Uploader for the configured S3 bucket.
    pub fn s3(credentials: &S3Settings, cfg: &ArtifactConfig) -> Result<Self, object_store::Error> {
        let store = AmazonS3Builder::new()
            .with_region(&cfg.region)
            .with_bucket_name(&cfg.bucket)
            .with_access_key_id(&credentials.access_key_id)
            .with_secret_access_key(&credentials.secret_access_key)
            .build()?;
        info!(bucket = %cfg.bucket, region = %cfg.region, "artifact bucket configured");
        Ok(Self::new(Arc::new(store)))
    }

    /// Uploader that keeps objects in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Keys of every stored object, sorted.
    pub async fn list_keys(&self) -> Result<Vec<String>, object_store::Error> {
        let mut keys: Vec<String> = self
            .store
            .list(None)
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await?;
        keys.sort();
        Ok(keys)
    }

    /// Read `local_path` fully and store it under `key`.
    pub async fn upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let contents = tokio::fs::read(local_path)
            .await
            .map_err(|source| UploadError::Read {
                path: local_path.to_path_buf(),
                source,
            })?;
        let size = contents.len();

        self.store
            .put(&ObjectPath::from(key), PutPayload::from(Bytes::from(contents)))
            .await
            .map_err(|source| UploadError::Store {
                key: key.to_string(),
                source,
            })?;

        debug!(%key, size, "artifact uploaded");
        Ok(())
    }
}

/// Background uploads submitted by the recorder.
///
/// Handles are kept only so the CLI can wait a bounded time before exiting;
/// dropping this queue detaches, not cancels, whatever is still running.
#[derive(Debug)]
pub struct UploadTasks {
    uploader: ArtifactUploader,
    pending: Vec<JoinHandle<()>>,
}

impl UploadTasks {
    pub fn new(uploader: ArtifactUploader) -> Self {
        Self {
            uploader,
            pending: Vec::new(),
        }
    }

    pub fn uploader(&self) -> &ArtifactUploader {
        &self.uploader
    }

    /// Start uploading `path` under `key` without waiting for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&mut self, kind: &'static str, path: PathBuf, key: String) {
        self.pending.retain(|handle| !handle.is_finished());

        let uploader = self.uploader.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = uploader.upload(&path, &key).await {
                error!(kind, %key, error = %e, "artifact upload failed");
            }
        });
        self.pending.push(handle);
    }

    /// Number of uploads not yet finished.
    pub fn in_flight(&self) -> usize {
        self.pending.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait up to `grace` for submitted uploads. Returns how many were
    /// still running when the grace period ran out; those keep running
    /// detached until the runtime shuts down.
    pub async fn drain(&mut self, grace: Duration) -> usize {
        let handles = std::mem::take(&mut self.pending);
        if handles.is_empty() {
            return 0;
        }

        let total = handles.len();
        let deadline = tokio::time::Instant::now() + grace;
        let mut abandoned = 0;
        for handle in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "artifact upload task panicked"),
                Err(_) => abandoned += 1,
            }
        }

        if abandoned > 0 {
            warn!(abandoned, total, "artifact uploads still running after grace period");
        } else {
            info!(total, "artifact uploads settled");
        }
        abandoned
    }
}
