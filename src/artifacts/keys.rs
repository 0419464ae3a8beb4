//! Object keys for uploaded artifacts.

use crate::storage::{SpecId, TestId};

/// `{test}_{spec}_{attempt}` where `attempt` is 1-based.
pub fn screenshot_key(test_id: TestId, spec_id: SpecId, attempt_index: u32) -> String {
    format!("{}_{}_{}", test_id, spec_id, attempt_index + 1)
}

/// One video per spec, keyed by the spec row id.
pub fn video_key(spec_id: SpecId) -> String {
    spec_id.to_string()
}
