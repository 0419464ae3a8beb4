//! Run configuration: environment resolution plus the optional TOML file.
//!
//! Every mandatory value is resolved up front by [`Settings::resolve`], so a
//! misconfigured CI job fails before the first database or network call.

pub mod file;

use std::collections::HashMap;

use thiserror::Error;

pub use self::file::{ArtifactConfig, DatabaseConfig, LoggingConfig, RecorderConfig};

/// Value returned for optional variables that are not set.
pub const PLACEHOLDER: &str = "Cypress test";

/// Every variable the operator must supply.
pub const REQUIRED_VARS: &[&str] = &[
    "RUNID",
    "ATTEMPT_NUMBER",
    "REPOSITORY",
    "COMMITTER",
    "TAG",
    "BRANCH",
    "THIS_RUNNER",
    "CYPRESS_DB_USER",
    "CYPRESS_DB_HOST",
    "CYPRESS_DB_NAME",
    "CYPRESS_DB_PWD",
    "CYPRESS_S3_ACCESS",
    "CYPRESS_S3_SECRET",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "environment variable {name} is not set; check that all of the following are set: [{}]",
        REQUIRED_VARS.join(", ")
    )]
    Missing { name: String },

    #[error("environment variable {name} has invalid value {value:?}: expected {expected}")]
    Invalid {
        name: String,
        value: String,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// EnvResolver
// ---------------------------------------------------------------------------

/// Snapshot of environment variables used to resolve configuration.
#[derive(Debug, Clone, Default)]
pub struct EnvResolver {
    vars: HashMap<String, String>,
}

impl EnvResolver {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a resolver from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up `name`. Absent required variables are an error, absent
    /// optional ones resolve to [`PLACEHOLDER`].
    pub fn resolve(&self, name: &str, required: bool) -> Result<String, ConfigError> {
        match self.vars.get(name) {
            Some(value) => Ok(value.clone()),
            None if required => Err(ConfigError::Missing {
                name: name.to_string(),
            }),
            None => Ok(PLACEHOLDER.to_string()),
        }
    }

    fn resolve_parsed<T: std::str::FromStr>(
        &self,
        name: &str,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        let value = self.resolve(name, true)?;
        value.trim().parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value,
            expected,
        })
    }
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Identifies this shard of this attempt of this workflow run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunIdentity {
    pub workflow_id: i64,
    pub attempt: i32,
    pub matrix_id: String,
    pub os: String,
    pub repo: String,
    pub committer: String,
    pub run_type: String,
    pub branch: String,
    pub commit_msg: String,
}

impl RunIdentity {
    pub fn from_env(env: &EnvResolver) -> Result<Self, ConfigError> {
        Ok(Self {
            commit_msg: env.resolve("COMMIT_INFO_MESSAGE", false)?,
            workflow_id: env.resolve_parsed("RUNID", "an integer workflow run id")?,
            attempt: env.resolve_parsed("ATTEMPT_NUMBER", "an integer attempt number")?,
            os: os_type().to_string(),
            repo: env.resolve("REPOSITORY", true)?,
            committer: env.resolve("COMMITTER", true)?,
            run_type: env.resolve("TAG", true)?,
            branch: env.resolve("BRANCH", true)?,
            matrix_id: env.resolve("THIS_RUNNER", true)?,
        })
    }
}

/// Credentials and endpoint for the relational store.
#[derive(Clone)]
pub struct DbSettings {
    pub user: String,
    pub host: String,
    pub database: String,
    pub password: String,
    pub port: u16,
    pub require_tls: bool,
    pub verify_tls: bool,
}

impl DbSettings {
    pub fn from_env(env: &EnvResolver, cfg: &DatabaseConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            user: env.resolve("CYPRESS_DB_USER", true)?,
            host: env.resolve("CYPRESS_DB_HOST", true)?,
            database: env.resolve("CYPRESS_DB_NAME", true)?,
            password: env.resolve("CYPRESS_DB_PWD", true)?,
            port: cfg.port,
            require_tls: cfg.require_tls,
            verify_tls: cfg.verify_tls,
        })
    }
}

impl std::fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSettings")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("database", &self.database)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("require_tls", &self.require_tls)
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// Credentials for the artifact bucket.
#[derive(Clone)]
pub struct S3Settings {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Settings {
    pub fn from_env(env: &EnvResolver) -> Result<Self, ConfigError> {
        Ok(Self {
            access_key_id: env.resolve("CYPRESS_S3_ACCESS", true)?,
            secret_access_key: env.resolve("CYPRESS_S3_SECRET", true)?,
        })
    }
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Everything a recording session needs, resolved before any I/O.
#[derive(Debug, Clone)]
pub struct Settings {
    pub identity: RunIdentity,
    pub database: DbSettings,
    pub storage: S3Settings,
}

impl Settings {
    pub fn resolve(env: &EnvResolver, cfg: &RecorderConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            database: DbSettings::from_env(env, &cfg.database)?,
            storage: S3Settings::from_env(env)?,
            identity: RunIdentity::from_env(env)?,
        })
    }
}

/// Host OS name in the form CI dashboards already group by.
pub fn os_type() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows_NT",
        other => other,
    }
}
