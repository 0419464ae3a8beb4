//! Feeds hook events from an NDJSON stream into a [`RunRecorder`].
//!
//! Each line is one hook invocation. Events are handled strictly in order
//! and each hook is awaited before the next line is read.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use super::{HookOutcome, RunRecorder};
use crate::events::HookEvent;
use crate::storage::RunStore;

/// Where in the lifecycle the stream currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingRun,
    BetweenSpecs,
    InSpec,
    Finished,
}

impl Phase {
    /// Whether `event` is the one the lifecycle expects next.
    fn accepts(self, event: &HookEvent) -> bool {
        matches!(
            (self, event),
            (Phase::AwaitingRun, HookEvent::BeforeRun { .. })
                | (Phase::BetweenSpecs, HookEvent::BeforeSpec { .. })
                | (Phase::BetweenSpecs, HookEvent::AfterRun { .. })
                | (Phase::InSpec, HookEvent::AfterSpec { .. })
        )
    }

    fn after(event: &HookEvent) -> Phase {
        match event {
            HookEvent::BeforeRun { .. } => Phase::BetweenSpecs,
            HookEvent::BeforeSpec { .. } => Phase::InSpec,
            HookEvent::AfterSpec { .. } => Phase::BetweenSpecs,
            HookEvent::AfterRun { .. } => Phase::Finished,
        }
    }
}

/// Counts reported once the stream ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub events: usize,
    pub specs: usize,
    pub failed_hooks: usize,
    pub malformed_lines: usize,
    pub out_of_order: usize,
    pub ignored_after_run: usize,
    pub finished: bool,
}

/// Read events from `reader` until EOF and dispatch them to `recorder`.
///
/// Only I/O errors on the stream itself are returned; malformed lines and
/// failed hooks are logged and counted.
pub async fn replay<R, S>(
    reader: R,
    recorder: &mut RunRecorder<S>,
) -> std::io::Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
    S: RunStore,
{
    let mut lines = reader.lines();
    let mut phase = Phase::AwaitingRun;
    let mut summary = ReplaySummary::default();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let event: HookEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed hook event");
                summary.malformed_lines += 1;
                continue;
            }
        };

        if phase == Phase::Finished {
            warn!(line = line_no, event = event.name(), "ignoring event after after:run");
            summary.ignored_after_run += 1;
            continue;
        }
        if !phase.accepts(&event) {
            warn!(line = line_no, event = event.name(), ?phase, "hook event out of lifecycle order");
            summary.out_of_order += 1;
        }

        debug!(line = line_no, event = event.name(), "dispatching hook");
        summary.events += 1;
        let outcome = match &event {
            HookEvent::BeforeRun { details } => recorder.before_run(details).await,
            HookEvent::BeforeSpec { spec } => {
                summary.specs += 1;
                recorder.before_spec(spec).await
            }
            HookEvent::AfterSpec { spec, results } => recorder.after_spec(spec, results).await,
            HookEvent::AfterRun { .. } => recorder.after_run().await,
        };
        if outcome == HookOutcome::Failed {
            summary.failed_hooks += 1;
        }
        phase = Phase::after(&event);
    }

    summary.finished = phase == Phase::Finished;
    if !summary.finished {
        warn!(?phase, "event stream ended before after:run");
    }
    Ok(summary)
}
