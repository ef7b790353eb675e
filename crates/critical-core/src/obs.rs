//! Structured lifecycle events for pipeline runs.
//!
//! Every event carries an `event` field (`pipeline.stage_entered`,
//! `pipeline.fragment_extracted`, ...) so JSON logs can be filtered on it.

use tracing::{info, warn};

use crate::state::PipelineState;

/// The span every event of one run belongs to.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("critical.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, routes: usize, viewports: usize) {
    info!(event = "pipeline.started", run_id = %run_id, routes, viewports);
}

pub fn emit_stage_entered(state: PipelineState) {
    info!(event = "pipeline.stage_entered", stage = %state);
}

pub fn emit_fragment_extracted(key: &str, bytes: usize) {
    info!(event = "pipeline.fragment_extracted", key = %key, bytes);
}

pub fn emit_fragment_skipped(key: &str, error: &dyn std::fmt::Display) {
    warn!(event = "pipeline.fragment_skipped", key = %key, error = %error);
}

pub fn emit_run_finished(run_id: &str, outcome: &str, duration_ms: u64, skipped: usize) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        outcome = %outcome,
        duration_ms,
        skipped,
    );
}

pub fn emit_cleanup_error(what: &str, error: &dyn std::fmt::Display) {
    warn!(event = "pipeline.cleanup_error", what = %what, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _entered = span.enter();
        emit_stage_entered(PipelineState::Extracting);
    }
}
