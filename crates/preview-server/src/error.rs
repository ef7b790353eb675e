//! Error types for preview-server

use thiserror::Error;

/// Errors raised while locating, starting or stopping a preview server.
#[derive(Error, Debug)]
pub enum PreviewError {
    /// Every port in the probe window was occupied
    #[error("No available port starting at {base} after {attempts} probes")]
    PortExhausted { base: u16, attempts: u16 },

    /// The server never answered its readiness probe
    #[error("Preview server at {url} not ready after {attempts} attempts")]
    StartTimeout { url: String, attempts: u32 },

    /// The server command could not be spawned
    #[error("Failed to spawn preview server: {0}")]
    Spawn(#[source] std::io::Error),

    /// The configured command template is empty
    #[error("Preview server command is empty")]
    EmptyCommand,

    /// The server process exited before becoming ready
    #[error("Preview server exited before becoming ready (exit code {code:?})")]
    ExitedEarly { code: Option<i32> },

    /// Signal delivery failed
    #[error("Signal delivery failed: {0}")]
    Signal(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for PreviewError {
    fn from(err: reqwest::Error) -> Self {
        PreviewError::Http(err.to_string())
    }
}

impl From<nix::Error> for PreviewError {
    fn from(err: nix::Error) -> Self {
        PreviewError::Signal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PreviewError>;
