//! Pipeline states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stages of one pipeline run, in execution order. `Failed` is reachable from
/// any state; `Cleanup` always runs before `Done` or `Failed` is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    ServerStarting,
    ServerReady,
    Building,
    Extracting,
    Combining,
    Injecting,
    Reducing,
    Reporting,
    Cleanup,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::ServerStarting => "server_starting",
            PipelineState::ServerReady => "server_ready",
            PipelineState::Building => "building",
            PipelineState::Extracting => "extracting",
            PipelineState::Combining => "combining",
            PipelineState::Injecting => "injecting",
            PipelineState::Reducing => "reducing",
            PipelineState::Reporting => "reporting",
            PipelineState::Cleanup => "cleanup",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        }
    }

    /// Whether artifacts in the build output may already have been rewritten
    /// when a run stops in this state.
    pub fn mutates_artifacts(&self) -> bool {
        matches!(self, PipelineState::Injecting | PipelineState::Reducing)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
