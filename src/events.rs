//! Hook payloads emitted by the test-execution engine.
//!
//! The engine-side shim serializes each hook invocation as one JSON object
//! per line. Field names follow the engine's camelCase payloads.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One lifecycle event, tagged by its hook name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum HookEvent {
    #[serde(rename = "before:run")]
    BeforeRun { details: RunDetails },

    #[serde(rename = "before:spec")]
    BeforeSpec { spec: SpecDescriptor },

    #[serde(rename = "after:spec")]
    AfterSpec {
        spec: SpecDescriptor,
        results: SpecResults,
    },

    #[serde(rename = "after:run")]
    AfterRun {
        #[serde(default)]
        details: Option<serde_json::Value>,
    },
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeRun { .. } => "before:run",
            Self::BeforeSpec { .. } => "before:spec",
            Self::AfterSpec { .. } => "after:spec",
            Self::AfterRun { .. } => "after:run",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetails {
    pub browser: Browser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Browser {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecDescriptor {
    /// Spec path relative to the project root.
    pub relative: String,
}

/// Results for one spec file, delivered with `after:spec`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecResults {
    pub stats: SpecStats,
    #[serde(default)]
    pub tests: Vec<TestResult>,
    #[serde(default)]
    pub screenshots: Vec<Screenshot>,
    #[serde(default)]
    pub video: Option<PathBuf>,
}

impl SpecResults {
    /// True when any attempt of any test failed, even if a retry passed.
    pub fn has_failed_attempt(&self) -> bool {
        self.tests.iter().any(TestResult::has_failed_attempt)
    }

    pub fn screenshots_for<'a>(&'a self, test_id: &'a str) -> impl Iterator<Item = &'a Screenshot> {
        self.screenshots.iter().filter(move |s| s.test_id == test_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecStats {
    #[serde(default)]
    pub tests: u32,
    #[serde(default)]
    pub passes: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub pending: u32,
    #[serde(default)]
    pub skipped: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    #[serde(default)]
    pub test_id: String,
    /// Suite titles followed by the test title.
    pub title: Vec<String>,
    pub state: String,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl TestResult {
    /// Name stored for the test: the first nested title, falling back to the
    /// last title segment for tests declared outside a suite.
    pub fn display_name(&self) -> &str {
        self.title
            .get(1)
            .or_else(|| self.title.last())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn has_failed_attempt(&self) -> bool {
        self.attempts.iter().any(AttemptRecord::is_failed)
    }
}

/// One try of a test. Fields other than `state` are kept verbatim so the
/// stored retry history matches what the engine reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub state: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AttemptRecord {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == "failed"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub path: PathBuf,
    pub test_id: String,
    /// 0-based index of the attempt that produced the screenshot.
    pub test_attempt_index: u32,
}
