//! External build invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{info, warn};

use crate::assets::discover_stylesheets;
use crate::config::BuildConfig;
use crate::error::{PipelineError, Result};

/// Result of one build invocation.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

impl BuildResult {
    /// Last `lines` lines of stderr, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Runs the project build and checks that it produced stylesheets.
pub struct BuildRunner {
    config: BuildConfig,
    working_dir: PathBuf,
}

impl BuildRunner {
    pub fn new(config: BuildConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            working_dir: working_dir.into(),
        }
    }

    /// Run the build command once with `env` added to its environment.
    ///
    /// The variables only reach the child; this process's environment is
    /// never modified.
    pub async fn execute(&self, env: &[(&str, &str)]) -> Result<BuildResult> {
        let start = Instant::now();

        let (exe, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| PipelineError::Build("build command is empty".into()))?;

        let child = Command::new(exe)
            .args(args)
            .current_dir(&self.working_dir)
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PipelineError::Build(format!("failed to spawn {exe}: {err}")))?;

        let output = if self.config.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(self.config.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| {
                PipelineError::Build(format!(
                    "build timed out after {} seconds",
                    self.config.timeout_secs
                ))
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(BuildResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }

    /// Build in analysis mode and return the stylesheets found under
    /// `assets_dir`. If there are none, rebuild once with the bundler plugin
    /// disabled. An empty build command skips building and only checks
    /// for existing artifacts.
    pub async fn build_with_artifacts(&self, assets_dir: &Path) -> Result<Vec<PathBuf>> {
        if self.config.command.is_empty() {
            info!("build command empty, using existing build output");
            return require_stylesheets(assets_dir);
        }

        self.run_checked(&[(self.config.analysis_flag.as_str(), "true")])
            .await?;
        let stylesheets = discover_stylesheets(assets_dir)?;
        if !stylesheets.is_empty() {
            return Ok(stylesheets);
        }

        warn!(
            dir = %assets_dir.display(),
            flag = %self.config.disable_plugin_flag,
            "no stylesheets after analysis build, rebuilding with plugin disabled"
        );
        self.run_checked(&[(self.config.disable_plugin_flag.as_str(), "true")])
            .await?;
        require_stylesheets(assets_dir)
    }

    async fn run_checked(&self, env: &[(&str, &str)]) -> Result<BuildResult> {
        info!(command = %self.config.command.join(" "), "running build");
        let result = self.execute(env).await?;
        if !result.success {
            return Err(PipelineError::Build(format!(
                "exit code {}: {}",
                result.exit_code,
                result.stderr_tail(20)
            )));
        }
        info!(duration_ms = result.duration_ms, "build finished");
        Ok(result)
    }
}

fn require_stylesheets(assets_dir: &Path) -> Result<Vec<PathBuf>> {
    let stylesheets = discover_stylesheets(assets_dir)?;
    if stylesheets.is_empty() {
        return Err(PipelineError::BuildArtifactMissing {
            assets_dir: assets_dir.to_path_buf(),
        });
    }
    Ok(stylesheets)
}
