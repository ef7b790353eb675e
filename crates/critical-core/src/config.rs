//! Pipeline configuration.
//!
//! Everything has a default, so an empty `{}` config file (or none at all)
//! describes the stock setup: five routes, desktop and mobile viewports,
//! `npm run build` and `npm run preview` in the project root.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use preview_server::ServerConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::model::{default_routes, default_viewports, Route, Viewport};

/// Config file looked up in the project root when no path is given.
pub const CONFIG_FILE_NAME: &str = "critical.config.json";

/// Name of the combined critical stylesheet inside the scratch directory.
pub const COMBINED_FILE_NAME: &str = "combined-critical.css";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Project root; relative paths below resolve against it.
    pub root_dir: PathBuf,
    /// Build output directory.
    pub dist_dir: PathBuf,
    /// Stylesheet directory inside the build output.
    pub assets_dir: PathBuf,
    /// Scratch directory for fragments and the combined stylesheet.
    pub scratch_dir: PathBuf,
    pub routes: Vec<Route>,
    pub viewports: Vec<Viewport>,
    pub server: ServerConfig,
    pub build: BuildConfig,
    pub extract: ExtractConfig,
    pub reduce: ReduceConfig,
    pub budget: BudgetConfig,
    /// Keep scratch files after the run.
    pub keep_scratch: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            dist_dir: PathBuf::from("dist"),
            assets_dir: PathBuf::from("assets"),
            scratch_dir: PathBuf::from("critical"),
            routes: default_routes(),
            viewports: default_viewports(),
            server: ServerConfig::default(),
            build: BuildConfig::default(),
            extract: ExtractConfig::default(),
            reduce: ReduceConfig::default(),
            budget: BudgetConfig::default(),
            keep_scratch: std::env::var("CLEANUP_CRITICAL_CSS")
                .map(|value| value == "false")
                .unwrap_or(false),
        }
    }
}

/// External build invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Command to run; the first element is the executable. Empty skips the build.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Set to `true` in the build's environment so the bundler plugin emits
    /// stylesheets unmodified.
    pub analysis_flag: String,
    /// Set to `true` on the retry build to disable the bundler plugin.
    pub disable_plugin_flag: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: vec!["npm".into(), "run".into(), "build".into()],
            timeout_secs: 600,
            analysis_flag: "CRITICAL_CSS_BUILD".into(),
            disable_plugin_flag: "CRITICAL_CSS_PLUGIN_DISABLED".into(),
        }
    }
}

/// Which extraction engine renders pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Headless Chrome driven over the DevTools protocol.
    Chrome,
    /// An external command: stylesheet on stdin, critical CSS on stdout.
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub engine: EngineKind,
    /// Argument template for [`EngineKind::Command`]. Placeholders: `{url}`,
    /// `{width}`, `{height}`, `{viewport}`, `{route}`.
    pub command: Vec<String>,
    /// Hard budget per (route, viewport).
    pub timeout_ms: u64,
    /// Delay after navigation before visibility is measured.
    pub render_wait_ms: u64,
    /// Selector prefixes always kept.
    pub force_include: Vec<String>,
    /// Declarations dropped from critical rules.
    pub drop_properties: Vec<String>,
    pub mobile_user_agent: String,
    pub desktop_user_agent: String,
    /// Chrome executable; discovered when unset.
    pub chrome_path: Option<PathBuf>,
    /// Pass `--no-sandbox` to Chrome.
    pub no_sandbox: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        let force_include = [
            "html", "body", "#app", ".container", ".max-w-", ".mx-auto", ".flex", ".grid",
            ".block", ".inline", ".text-", ".font-", ".leading-", ".bg-", ".border-",
            ".rounded-", ".p-", ".m-", ".w-", ".h-",
        ];
        Self {
            engine: EngineKind::Chrome,
            command: Vec::new(),
            timeout_ms: 30_000,
            render_wait_ms: 2_000,
            force_include: force_include.iter().map(|s| s.to_string()).collect(),
            drop_properties: ["transform", "-webkit-transform", "transition", "animation"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            mobile_user_agent:
                "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X) AppleWebKit/605.1.15"
                    .into(),
            desktop_user_agent:
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36".into(),
            chrome_path: None,
            no_sandbox: true,
        }
    }
}

impl ExtractConfig {
    /// User agent for a viewport: the mobile one for viewports named `mobile`.
    pub fn user_agent_for(&self, viewport: &Viewport) -> &str {
        if viewport.name.eq_ignore_ascii_case("mobile") {
            &self.mobile_user_agent
        } else {
            &self.desktop_user_agent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceConfig {
    /// Critical rules this short or shorter are never removed from the main stylesheet.
    pub min_rule_len: usize,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            min_rule_len: critical_css::DEFAULT_MIN_RULE_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Critical CSS byte budget.
    pub max_critical_bytes: u64,
    /// Fraction of the budget above which a warning is reported.
    pub warning_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_critical_bytes: 14_000,
            warning_threshold: 0.8,
        }
    }
}

impl PipelineConfig {
    /// Read a config file. Relative paths inside it resolve against the
    /// file's directory unless it sets `root_dir`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        let mut config: PipelineConfig = serde_json::from_str(&text)?;
        if config.root_dir.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.root_dir = base.join(&config.root_dir);
        }
        debug!(path = %path.display(), "loaded pipeline config");
        Ok(config)
    }

    /// `critical.config.json` under `root` if present, otherwise defaults
    /// rooted at `root`.
    pub fn discover(root: &Path) -> Result<Self> {
        let candidate = root.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default().with_root(root))
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_dir = root.into();
        self
    }

    pub fn with_routes(mut self, routes: Vec<Route>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_viewports(mut self, viewports: Vec<Viewport>) -> Self {
        self.viewports = viewports;
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    pub fn dist_path(&self) -> PathBuf {
        self.resolve(&self.dist_dir)
    }

    pub fn assets_path(&self) -> PathBuf {
        if self.assets_dir.is_absolute() {
            self.assets_dir.clone()
        } else {
            self.dist_path().join(&self.assets_dir)
        }
    }

    pub fn scratch_path(&self) -> PathBuf {
        self.resolve(&self.scratch_dir)
    }

    pub fn combined_path(&self) -> PathBuf {
        self.scratch_path().join(COMBINED_FILE_NAME)
    }

    /// Reject configurations no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.routes.is_empty() {
            return Err(PipelineError::Config("no routes configured".into()));
        }
        if self.viewports.is_empty() {
            return Err(PipelineError::Config("no viewports configured".into()));
        }

        let mut names = HashSet::new();
        for route in &self.routes {
            if route.name.is_empty() || route.name.contains(['/', '\\']) {
                return Err(PipelineError::Config(format!(
                    "route {} has an unusable name {:?}",
                    route.path, route.name
                )));
            }
            if !names.insert(route.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate route name {}",
                    route.name
                )));
            }
        }

        let mut names = HashSet::new();
        for viewport in &self.viewports {
            if viewport.width == 0 || viewport.height == 0 {
                return Err(PipelineError::Config(format!(
                    "viewport {} has zero size",
                    viewport.name
                )));
            }
            if !names.insert(viewport.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate viewport name {}",
                    viewport.name
                )));
            }
        }

        if self.server.command.is_empty() {
            return Err(PipelineError::Config("preview server command is empty".into()));
        }
        if self.extract.engine == EngineKind::Command && self.extract.command.is_empty() {
            return Err(PipelineError::Config(
                "extract.engine is \"command\" but extract.command is empty".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.budget.warning_threshold) {
            return Err(PipelineError::Config(
                "budget.warning_threshold must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}
