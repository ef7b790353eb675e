//! Critical CSS extraction.
//!
//! A [`CriticalEngine`] renders one page at one viewport and returns the
//! subset of the stylesheet that applies above the fold. [`CriticalExtractor`]
//! wraps an engine with the per-combination timeout, sanitization and
//! fragment persistence, and turns every failure into a skipped combination.

mod chrome;
mod command;
mod source;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{EngineKind, ExtractConfig};
use crate::error::{PipelineError, Result};
use crate::fs::ScratchDir;
use crate::model::{fragment_key, CriticalFragment, Route, Viewport};
use crate::obs;

pub use chrome::ChromeEngine;
pub use command::CommandEngine;

/// Everything an engine needs to extract one fragment.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    /// Absolute URL of the page on the preview server.
    pub url: String,
    pub route: Route,
    pub viewport: Viewport,
    /// Full text of the main stylesheet.
    pub stylesheet: Arc<str>,
    pub user_agent: String,
    pub render_wait: Duration,
    pub force_include: Vec<String>,
    pub drop_properties: Vec<String>,
}

/// A rendering backend that computes above-the-fold CSS.
#[async_trait]
pub trait CriticalEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Return the critical subset of `request.stylesheet`. An empty string
    /// means nothing applied.
    async fn extract(&self, request: &ExtractRequest) -> anyhow::Result<String>;

    /// Release rendering resources. Called once at the end of extraction.
    async fn close(&self) {}
}

/// Build the engine selected by `config`.
pub fn engine_from_config(config: &ExtractConfig) -> Arc<dyn CriticalEngine> {
    match config.engine {
        EngineKind::Chrome => Arc::new(ChromeEngine::new(config.clone())),
        EngineKind::Command => Arc::new(CommandEngine::new(config.command.clone())),
    }
}

/// Runs an engine for one (route, viewport) at a time.
pub struct CriticalExtractor {
    engine: Arc<dyn CriticalEngine>,
    config: ExtractConfig,
    scratch: ScratchDir,
}

impl CriticalExtractor {
    pub fn new(engine: Arc<dyn CriticalEngine>, config: ExtractConfig, scratch: ScratchDir) -> Self {
        Self {
            engine,
            config,
            scratch,
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    fn request(
        &self,
        base_url: &str,
        route: &Route,
        viewport: &Viewport,
        stylesheet: &Arc<str>,
    ) -> ExtractRequest {
        ExtractRequest {
            url: format!("{}{}", base_url.trim_end_matches('/'), route.path),
            route: route.clone(),
            viewport: viewport.clone(),
            stylesheet: Arc::clone(stylesheet),
            user_agent: self.config.user_agent_for(viewport).to_string(),
            render_wait: Duration::from_millis(self.config.render_wait_ms),
            force_include: self.config.force_include.clone(),
            drop_properties: self.config.drop_properties.clone(),
        }
    }

    /// Extract, sanitize and persist one fragment.
    ///
    /// Engine failures, timeouts and empty results are returned as
    /// [`PipelineError::Extraction`] or [`PipelineError::ExtractionTimeout`].
    pub async fn try_extract(
        &self,
        base_url: &str,
        route: &Route,
        viewport: &Viewport,
        stylesheet: &Arc<str>,
    ) -> Result<CriticalFragment> {
        let key = fragment_key(route, viewport);
        let request = self.request(base_url, route, viewport, stylesheet);
        debug!(key = %key, url = %request.url, engine = self.engine.name(), "extracting");

        let timeout_ms = self.config.timeout_ms;
        let raw = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.engine.extract(&request),
        )
        .await
        {
            Ok(Ok(css)) => css,
            Ok(Err(err)) => {
                return Err(PipelineError::Extraction {
                    key,
                    reason: format!("{err:#}"),
                })
            }
            Err(_) => return Err(PipelineError::ExtractionTimeout { key, timeout_ms }),
        };

        let css = critical_css::sanitize_css(&raw);
        if css.trim().is_empty() {
            return Err(PipelineError::Extraction {
                key,
                reason: "engine returned no critical CSS".into(),
            });
        }

        let fragment = CriticalFragment::new(route, viewport, css);
        if let Err(err) = self.scratch.write_fragment(&fragment) {
            warn!(key = %fragment.key, error = %err, "failed to write fragment file");
        }
        Ok(fragment)
    }

    /// Like [`CriticalExtractor::try_extract`] but logs recoverable failures
    /// and returns `Ok(None)`, so the caller can move on to the next
    /// combination.
    pub async fn extract(
        &self,
        base_url: &str,
        route: &Route,
        viewport: &Viewport,
        stylesheet: &Arc<str>,
    ) -> Result<Option<CriticalFragment>> {
        match self.try_extract(base_url, route, viewport, stylesheet).await {
            Ok(fragment) => {
                obs::emit_fragment_extracted(&fragment.key, fragment.css.len());
                Ok(Some(fragment))
            }
            Err(err) if err.is_recoverable() => {
                obs::emit_fragment_skipped(&fragment_key(route, viewport), &err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
