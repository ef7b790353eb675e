//! Pipeline orchestrator.
//!
//! A [`CriticalPipeline`] owns everything one run touches: the preview
//! server, the extraction engine, the fragments and the metrics. Stages run
//! strictly in order; any fatal error or a shutdown signal jumps straight to
//! cleanup, which runs exactly once per pipeline.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use preview_server::PreviewServer;
use serde::Serialize;
use tracing::{debug, info, warn, Instrument};

use crate::build::BuildRunner;
use crate::combine::{CombinedCritical, Combiner};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::extract::{engine_from_config, CriticalEngine, CriticalExtractor};
use crate::fs::ScratchDir;
use crate::inject::{HtmlInjector, InjectedDocument};
use crate::metrics::{PerformanceMetrics, PerformanceReport};
use crate::model::{combinations, CriticalFragment};
use crate::obs;
use crate::reduce::{reduce_all, ReducedStylesheet};
use crate::state::PipelineState;

/// What a run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Server, build, extraction, combine, injection and reduction.
    Full,
    /// Combine the fragments already in the scratch directory and inject
    /// them. Scratch files are left in place.
    Process,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed,
    CompletedWithSkips { skipped: usize },
    Failed { stage: PipelineState, error: String },
    Interrupted { signal: String },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PipelineOutcome::Completed | PipelineOutcome::CompletedWithSkips { .. }
        )
    }

    /// Process exit code: 0 on success, 130/143 for SIGINT/SIGTERM, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Completed | PipelineOutcome::CompletedWithSkips { .. } => 0,
            PipelineOutcome::Interrupted { signal } => match signal.as_str() {
                "SIGINT" => 130,
                "SIGTERM" => 143,
                _ => 1,
            },
            PipelineOutcome::Failed { .. } => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineOutcome::Completed => "completed",
            PipelineOutcome::CompletedWithSkips { .. } => "completed_with_skips",
            PipelineOutcome::Failed { .. } => "failed",
            PipelineOutcome::Interrupted { .. } => "interrupted",
        }
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Completed => f.write_str("completed fully"),
            PipelineOutcome::CompletedWithSkips { skipped } => {
                write!(f, "completed with {skipped} skipped combinations")
            }
            PipelineOutcome::Failed { stage, error } => write!(f, "failed at stage {stage}: {error}"),
            PipelineOutcome::Interrupted { signal } => write!(f, "interrupted by {signal}"),
        }
    }
}

/// Everything a finished run reports back.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub outcome: PipelineOutcome,
    /// Every state entered, in order, ending with `done` or `failed`.
    pub states: Vec<PipelineState>,
    /// Keys of the fragments that were extracted.
    pub fragments: Vec<String>,
    pub documents: Vec<InjectedDocument>,
    pub stylesheets: Vec<ReducedStylesheet>,
    /// Present whenever combining succeeded.
    pub report: Option<PerformanceReport>,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// One pipeline run over one build output.
pub struct CriticalPipeline {
    config: PipelineConfig,
    engine: Arc<dyn CriticalEngine>,
    scratch: ScratchDir,
    run_id: String,
    state: PipelineState,
    states: Vec<PipelineState>,
    metrics: PerformanceMetrics,
    fragments: Vec<CriticalFragment>,
    server: Option<PreviewServer>,
    combined: Option<CombinedCritical>,
    documents: Vec<InjectedDocument>,
    stylesheets: Vec<ReducedStylesheet>,
    cleaned_up: bool,
}

impl CriticalPipeline {
    /// Validate `config` and build the engine it selects.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let engine = engine_from_config(&config.extract);
        Self::with_engine(config, engine)
    }

    /// Use `engine` instead of the configured one.
    pub fn with_engine(config: PipelineConfig, engine: Arc<dyn CriticalEngine>) -> Result<Self> {
        config.validate()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let metrics = PerformanceMetrics::new(&run_id, config.routes.len(), config.viewports.len());
        Ok(Self {
            scratch: ScratchDir::new(config.scratch_path()),
            engine,
            run_id,
            state: PipelineState::Init,
            states: Vec::new(),
            metrics,
            fragments: Vec::new(),
            server: None,
            combined: None,
            documents: Vec::new(),
            stylesheets: Vec::new(),
            cleaned_up: false,
            config,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run without an external shutdown signal.
    pub async fn run(self, mode: RunMode) -> RunSummary {
        self.run_with_shutdown(mode, std::future::pending()).await
    }

    /// Run until done or until `shutdown` resolves with a signal name, in
    /// which case the current stage is abandoned and cleanup runs.
    pub async fn run_with_shutdown<F>(mut self, mode: RunMode, shutdown: F) -> RunSummary
    where
        F: Future<Output = String>,
    {
        let span = obs::run_span(&self.run_id);
        async move {
            obs::emit_run_started(&self.run_id, self.config.routes.len(), self.config.viewports.len());

            let result = tokio::select! {
                result = self.execute(mode) => result,
                signal = shutdown => Err(PipelineError::Interrupted { signal }),
            };

            let outcome = match result {
                Ok(()) if self.metrics.skipped > 0 => PipelineOutcome::CompletedWithSkips {
                    skipped: self.metrics.skipped,
                },
                Ok(()) => PipelineOutcome::Completed,
                Err(PipelineError::Interrupted { signal }) => PipelineOutcome::Interrupted { signal },
                Err(err) => {
                    let stage = err.stage().unwrap_or(self.state);
                    if stage.mutates_artifacts() {
                        warn!(
                            %stage,
                            dist = %self.config.dist_path().display(),
                            "run failed after rewriting build output; some files may be partially processed"
                        );
                    }
                    PipelineOutcome::Failed {
                        stage,
                        error: err.to_string(),
                    }
                }
            };

            let interrupted = matches!(outcome, PipelineOutcome::Interrupted { .. });
            let report = if !interrupted && self.combined.is_some() {
                Some(self.report())
            } else {
                None
            };

            self.cleanup(mode).await;
            self.enter(if outcome.is_success() {
                PipelineState::Done
            } else {
                PipelineState::Failed
            });

            obs::emit_run_finished(
                &self.run_id,
                outcome.as_str(),
                self.metrics.elapsed_ms(),
                self.metrics.skipped,
            );
            info!(summary = %outcome, "critical CSS run finished");

            RunSummary {
                run_id: self.run_id.clone(),
                mode,
                outcome,
                states: std::mem::take(&mut self.states),
                fragments: self.fragments.iter().map(|f| f.key.clone()).collect(),
                documents: std::mem::take(&mut self.documents),
                stylesheets: std::mem::take(&mut self.stylesheets),
                report,
            }
        }
        .instrument(span)
        .await
    }

    fn enter(&mut self, state: PipelineState) {
        self.state = state;
        self.states.push(state);
        obs::emit_stage_entered(state);
    }

    async fn execute(&mut self, mode: RunMode) -> Result<()> {
        self.enter(PipelineState::Init);
        self.scratch.ensure()?;
        match mode {
            RunMode::Full => self.execute_full().await,
            RunMode::Process => self.execute_process().await,
        }
    }

    async fn execute_full(&mut self) -> Result<()> {
        let root = self.config.root_dir.clone();
        let dist = self.config.dist_path();
        let routes = self.config.routes.clone();
        let viewports = self.config.viewports.clone();

        self.enter(PipelineState::ServerStarting);
        let server = self.server.insert(PreviewServer::new(
            self.config.server.clone(),
            &root,
            &dist,
        )?);
        let base_url = server.start().await?.base_url().to_string();
        self.enter(PipelineState::ServerReady);

        self.enter(PipelineState::Building);
        let stylesheets = BuildRunner::new(self.config.build.clone(), &root)
            .build_with_artifacts(&self.config.assets_path())
            .await?;
        let main_path = main_stylesheet(&stylesheets, &self.config.assets_path())?;
        let main_css: Arc<str> = tokio::fs::read_to_string(&main_path).await?.into();
        self.metrics.record_original(main_css.len() as u64);
        debug!(path = %main_path.display(), bytes = main_css.len(), "main stylesheet");

        self.enter(PipelineState::Extracting);
        let extractor = CriticalExtractor::new(
            Arc::clone(&self.engine),
            self.config.extract.clone(),
            self.scratch.clone(),
        );
        info!(engine = extractor.engine_name(), combinations = routes.len() * viewports.len(), "extracting critical CSS");
        for (route, viewport) in combinations(&routes, &viewports) {
            let fragment = extractor.extract(&base_url, route, viewport, &main_css).await?;
            self.metrics.record_extraction(fragment.is_some());
            self.fragments.extend(fragment);
        }

        let css = self.combine(Combiner::new(self.scratch.clone(), &routes, &viewports), false)?;
        self.inject(&dist, &css)?;

        self.enter(PipelineState::Reducing);
        self.stylesheets = reduce_all(&stylesheets, &css, self.config.reduce.min_rule_len)?;
        let reduced_main = self
            .stylesheets
            .iter()
            .find(|sheet| sheet.path == main_path)
            .map_or(0, |sheet| sheet.reduced_bytes);
        self.metrics.record_reduced(reduced_main as u64);
        Ok(())
    }

    async fn execute_process(&mut self) -> Result<()> {
        let dist = self.config.dist_path();
        let combiner = Combiner::new(
            self.scratch.clone(),
            &self.config.routes,
            &self.config.viewports,
        );
        let css = self.combine(combiner, true)?;
        self.inject(&dist, &css)
    }

    fn combine(&mut self, combiner: Combiner, from_scratch: bool) -> Result<String> {
        self.enter(PipelineState::Combining);
        let combined = if from_scratch {
            combiner.combine_from_scratch()?
        } else {
            combiner.combine(&self.fragments)?
        };
        self.metrics.record_critical(combined.size() as u64);
        let css = combined.css.clone();
        self.combined = Some(combined);
        Ok(css)
    }

    fn inject(&mut self, dist: &std::path::Path, css: &str) -> Result<()> {
        self.enter(PipelineState::Injecting);
        self.documents = HtmlInjector::new(dist).inject_routes(&self.config.routes, css)?;
        Ok(())
    }

    fn report(&mut self) -> PerformanceReport {
        self.enter(PipelineState::Reporting);
        let report = PerformanceReport::from_metrics(
            &self.metrics,
            &self.config.budget,
            self.combined.as_ref().map(|combined| combined.css.as_str()),
        );
        info!(
            event = "pipeline.report",
            critical_bytes = report.critical_css_bytes,
            original_bytes = report.original_css_bytes,
            reduced_bytes = report.reduced_main_css_bytes,
            budget_percent = report.budget.utilisation_percent,
        );
        report
    }

    /// Stop the server, release the engine and clear the scratch directory.
    /// Only the first call does anything.
    async fn cleanup(&mut self, mode: RunMode) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.enter(PipelineState::Cleanup);

        self.engine.close().await;

        if let Some(mut server) = self.server.take() {
            if let Err(err) = server.stop().await {
                obs::emit_cleanup_error("preview server", &err);
            }
        }

        if mode == RunMode::Full && !self.config.keep_scratch {
            match self.scratch.clear() {
                Ok(removed) => debug!(removed, dir = %self.scratch.path().display(), "cleared scratch directory"),
                Err(err) => obs::emit_cleanup_error("scratch directory", &err),
            }
        }
    }
}

/// The first discovered stylesheet feeds extraction.
fn main_stylesheet(stylesheets: &[PathBuf], assets_dir: &std::path::Path) -> Result<PathBuf> {
    stylesheets
        .first()
        .cloned()
        .ok_or_else(|| PipelineError::BuildArtifactMissing {
            assets_dir: assets_dir.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Route, Viewport};
    use async_trait::async_trait;

    struct NoEngine;

    #[async_trait]
    impl CriticalEngine for NoEngine {
        fn name(&self) -> &str {
            "none"
        }

        async fn extract(&self, _request: &crate::extract::ExtractRequest) -> anyhow::Result<String> {
            anyhow::bail!("not used")
        }
    }

    fn config(root: &std::path::Path) -> PipelineConfig {
        PipelineConfig::default()
            .with_root(root)
            .with_routes(vec![Route::new("/"), Route::new("/about")])
            .with_viewports(vec![
                Viewport::new("mobile", 375, 667),
                Viewport::new("desktop", 1300, 900),
            ])
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(PipelineOutcome::Completed.exit_code(), 0);
        assert_eq!(PipelineOutcome::CompletedWithSkips { skipped: 2 }.exit_code(), 0);
        let failed = PipelineOutcome::Failed {
            stage: PipelineState::Combining,
            error: "boom".into(),
        };
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(failed.to_string(), "failed at stage combining: boom");
        assert_eq!(
            PipelineOutcome::Interrupted { signal: "SIGINT".into() }.exit_code(),
            130
        );
        assert_eq!(
            PipelineOutcome::Interrupted { signal: "SIGTERM".into() }.exit_code(),
            143
        );
        assert_eq!(
            PipelineOutcome::CompletedWithSkips { skipped: 1 }.to_string(),
            "completed with 1 skipped combinations"
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).with_routes(Vec::new());
        assert!(matches!(
            CriticalPipeline::with_engine(config, Arc::new(NoEngine)),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_process_mode_combines_scratch_and_injects() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("dist")).unwrap();
        std::fs::create_dir_all(root.join("critical")).unwrap();
        std::fs::write(
            root.join("dist/index.html"),
            "<html><head><title>t</title></head><body></body></html>",
        )
        .unwrap();
        std::fs::write(root.join("critical/home-mobile.css"), "body {\n  margin:0;\n}").unwrap();
        std::fs::write(root.join("critical/home-desktop.css"), "body{margin:0}\n.hero{height:80vh}").unwrap();

        let pipeline = CriticalPipeline::with_engine(config(root), Arc::new(NoEngine)).unwrap();
        let summary = pipeline.run(RunMode::Process).await;

        assert_eq!(summary.outcome, PipelineOutcome::Completed);
        assert_eq!(
            summary.states,
            vec![
                PipelineState::Init,
                PipelineState::Combining,
                PipelineState::Injecting,
                PipelineState::Reporting,
                PipelineState::Cleanup,
                PipelineState::Done,
            ]
        );
        let html = std::fs::read_to_string(root.join("dist/index.html")).unwrap();
        assert!(html.contains(">body{margin:0}.hero{height:80vh}</style>"));
        assert!(root.join("critical/home-mobile.css").exists());

        let report = summary.report.unwrap();
        assert_eq!(report.critical_css_bytes, "body{margin:0}.hero{height:80vh}".len() as u64);
    }

    #[tokio::test]
    async fn test_process_mode_without_fragments_fails_at_combining() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = CriticalPipeline::with_engine(config(dir.path()), Arc::new(NoEngine)).unwrap();
        let summary = pipeline.run(RunMode::Process).await;

        assert!(matches!(
            summary.outcome,
            PipelineOutcome::Failed { stage: PipelineState::Combining, .. }
        ));
        assert!(summary.report.is_none());
        assert_eq!(summary.states.last(), Some(&PipelineState::Failed));
        assert_eq!(
            summary.states.iter().filter(|s| **s == PipelineState::Cleanup).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_interrupts_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.server = config
            .server
            .clone()
            .with_command(["sleep", "30"])
            .with_ports(47_310, 5)
            .with_readiness(60, 500);
        config.server.reuse_running = false;

        let pipeline = CriticalPipeline::with_engine(config, Arc::new(NoEngine)).unwrap();
        let shutdown = async {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            "SIGTERM".to_string()
        };
        let summary = pipeline.run_with_shutdown(RunMode::Full, shutdown).await;

        assert_eq!(
            summary.outcome,
            PipelineOutcome::Interrupted { signal: "SIGTERM".into() }
        );
        assert_eq!(summary.exit_code(), 143);
        assert!(summary.states.contains(&PipelineState::ServerStarting));
        assert_eq!(summary.states.last(), Some(&PipelineState::Failed));
    }
}
