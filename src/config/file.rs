//! TOML configuration for non-secret tunables.
//!
//! Credentials and run identifiers always come from the environment; this
//! file only carries values that differ between deployments of the recorder
//! itself (bucket, region, database port, logging).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable naming a config file to load.
pub const CONFIG_ENV: &str = "RUNLEDGER_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RecorderConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the config file in order:
    /// 1. `explicit` (the `--config` flag).
    /// 2. The path in `RUNLEDGER_CONFIG`.
    /// 3. Compiled-in defaults.
    ///
    /// A path that was asked for but cannot be read is an error. Also returns
    /// the path that was loaded, if any.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        match path {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub port: u16,
    /// Refuse unencrypted connections.
    pub require_tls: bool,
    /// Check the server certificate and host name when TLS is required.
    pub verify_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            port: 5432,
            require_tls: true,
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub bucket: String,
    pub region: String,
    /// How long the CLI waits for in-flight uploads after `after:run`.
    pub upload_grace_secs: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            bucket: "appsmith-internal-cy-db".to_string(),
            region: "ap-south-1".to_string(),
            upload_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[artifacts]\nbucket = \"qa-artifacts\"\n").unwrap();

        let cfg = RecorderConfig::load(file.path()).unwrap();
        assert_eq!(cfg.artifacts.bucket, "qa-artifacts");
        assert_eq!(cfg.artifacts.region, "ap-south-1");
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.logging.filter, "info");
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = RecorderConfig::load_or_default(Some(Path::new("/nonexistent/runledger.toml")))
            .unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_explicit_file_is_reported_as_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\njson = true").unwrap();

        let (cfg, source) = RecorderConfig::load_or_default(Some(file.path())).unwrap();
        assert!(cfg.logging.json);
        assert_eq!(source.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\nport = \"not a port\"").unwrap();
        assert!(RecorderConfig::load(file.path()).is_err());
    }
}
