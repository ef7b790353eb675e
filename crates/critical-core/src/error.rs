//! Error types for the critical CSS pipeline

use std::path::PathBuf;

use preview_server::PreviewError;
use thiserror::Error;

use crate::state::PipelineState;

/// Errors raised by pipeline stages.
///
/// Extraction errors are non-fatal: the orchestrator logs them and skips the
/// combination. Everything else unwinds to the orchestrator and ends the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No port in the probe window could be used
    #[error("No available port starting at {base} after {attempts} probes")]
    PortExhausted { base: u16, attempts: u16 },

    /// Preview server never became ready
    #[error("Preview server at {url} not ready after {attempts} attempts")]
    ServerStartTimeout { url: String, attempts: u32 },

    /// Any other preview server failure
    #[error("Preview server error: {0}")]
    Server(#[source] PreviewError),

    /// Build command failed
    #[error("Build failed: {0}")]
    Build(String),

    /// The build produced no usable stylesheet
    #[error("No non-empty stylesheet found under {}", .assets_dir.display())]
    BuildArtifactMissing { assets_dir: PathBuf },

    /// The entry HTML document does not exist
    #[error("Entry HTML not found: {}", .0.display())]
    EntryHtmlMissing(PathBuf),

    /// Extraction failed for one combination
    #[error("Extraction failed for {key}: {reason}")]
    Extraction { key: String, reason: String },

    /// Extraction exceeded its per-combination budget
    #[error("Extraction for {key} timed out after {timeout_ms} ms")]
    ExtractionTimeout { key: String, timeout_ms: u64 },

    /// Combining fragments failed
    #[error("Combine failed: {0}")]
    Combine(String),

    /// Rewriting an HTML document failed
    #[error("Injection into {} failed: {reason}", .path.display())]
    Injection { path: PathBuf, reason: String },

    /// Rewriting a stylesheet failed
    #[error("Reduction of {} failed: {reason}", .path.display())]
    Reduction { path: PathBuf, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The run was interrupted by a signal
    #[error("Interrupted by {signal}")]
    Interrupted { signal: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// The stage this error belongs to, when it is tied to one.
    pub fn stage(&self) -> Option<PipelineState> {
        match self {
            PipelineError::PortExhausted { .. }
            | PipelineError::ServerStartTimeout { .. }
            | PipelineError::Server(_) => Some(PipelineState::ServerStarting),
            PipelineError::Build(_) | PipelineError::BuildArtifactMissing { .. } => {
                Some(PipelineState::Building)
            }
            PipelineError::Extraction { .. } | PipelineError::ExtractionTimeout { .. } => {
                Some(PipelineState::Extracting)
            }
            PipelineError::Combine(_) => Some(PipelineState::Combining),
            PipelineError::EntryHtmlMissing(_) | PipelineError::Injection { .. } => {
                Some(PipelineState::Injecting)
            }
            PipelineError::Reduction { .. } => Some(PipelineState::Reducing),
            PipelineError::Config(_) => Some(PipelineState::Init),
            PipelineError::Interrupted { .. } | PipelineError::Io(_) | PipelineError::Json(_) => {
                None
            }
        }
    }

    /// Whether the run can continue past this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Extraction { .. } | PipelineError::ExtractionTimeout { .. }
        )
    }
}

impl From<PreviewError> for PipelineError {
    fn from(err: PreviewError) -> Self {
        match err {
            PreviewError::PortExhausted { base, attempts } => {
                PipelineError::PortExhausted { base, attempts }
            }
            PreviewError::StartTimeout { url, attempts } => {
                PipelineError::ServerStartTimeout { url, attempts }
            }
            other => PipelineError::Server(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
