//! Critical CSS pipeline CLI
//!
//! The `critical` command inlines above-the-fold CSS into a built static site.
//!
//! ## Commands
//!
//! - `run`: start the preview server, build, extract, combine, inject and reduce
//! - `process`: combine fragments left in the scratch directory and inject them
//! - `analyze`: report critical CSS coverage of the built HTML
//! - `serve`: expose the combined stylesheet at `/critical-css-preview`

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use critical_core::config::EngineKind;
use critical_core::{
    analyze_build, inspect, write_report_json, CriticalPipeline, PipelineConfig, Route, RunMode,
    RunSummary,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "critical")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inline critical CSS into a built single-page application", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON results on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: critical.config.json in the project root, if present)
    #[arg(short, long, global = true, env = "CRITICAL_CONFIG")]
    config: Option<PathBuf>,

    /// Project root
    #[arg(long, global = true, env = "CRITICAL_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Build output directory, relative to the project root
    #[arg(long, env = "CRITICAL_DIST_DIR")]
    dist: Option<PathBuf>,

    /// Routes to process, comma separated (e.g. /,/about)
    #[arg(long, value_delimiter = ',')]
    routes: Vec<String>,

    /// Write the performance report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Engine {
    Chrome,
    Command,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline against a fresh build
    Run {
        #[command(flatten)]
        project: ProjectArgs,

        /// First port probed for the preview server
        #[arg(long, env = "CRITICAL_PORT")]
        port: Option<u16>,

        /// Extraction engine
        #[arg(long, value_enum)]
        engine: Option<Engine>,

        /// Use the existing build output instead of running the build command
        #[arg(long)]
        skip_build: bool,

        /// Keep fragment files and the combined stylesheet after the run
        #[arg(long)]
        keep_scratch: bool,
    },

    /// Combine fragments from the scratch directory and inject them
    Process {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Report critical CSS coverage of the built HTML
    Analyze {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Serve the combined critical stylesheet for inspection
    Serve {
        /// Listen address
        #[arg(long, env = "CRITICAL_INSPECT_ADDR", default_value = "127.0.0.1:3001")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    critical_core::init_tracing(cli.json, level);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref(), &cli.root)?;

    match cli.command {
        Commands::Run {
            project,
            port,
            engine,
            skip_build,
            keep_scratch,
        } => {
            apply_project(&mut config, &project);
            if let Some(port) = port {
                config.server.base_port = port;
            }
            if let Some(engine) = engine {
                config.extract.engine = match engine {
                    Engine::Chrome => EngineKind::Chrome,
                    Engine::Command => EngineKind::Command,
                };
            }
            if skip_build {
                config.build.command.clear();
            }
            config.keep_scratch |= keep_scratch;
            cmd_pipeline(config, RunMode::Full, project.report.as_deref(), cli.json).await
        }
        Commands::Process { project } => {
            apply_project(&mut config, &project);
            cmd_pipeline(config, RunMode::Process, project.report.as_deref(), cli.json).await
        }
        Commands::Analyze { project } => {
            apply_project(&mut config, &project);
            cmd_analyze(&config, cli.json)
        }
        Commands::Serve { addr } => cmd_serve(&config, addr).await,
    }
}

fn load_config(path: Option<&Path>, root: &Path) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::discover(root).context("Failed to load project config")?,
    };
    Ok(config)
}

fn apply_project(config: &mut PipelineConfig, project: &ProjectArgs) {
    if let Some(dist) = &project.dist {
        config.dist_dir = dist.clone();
    }
    if !project.routes.is_empty() {
        config.routes = project.routes.iter().map(|path| Route::new(path)).collect();
    }
}

/// Resolves with the name of the first SIGINT or SIGTERM received.
fn shutdown_signal() -> Result<impl Future<Output = String>> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => "SIGINT".to_string(),
            _ = sigterm.recv() => "SIGTERM".to_string(),
        }
    })
}

async fn cmd_pipeline(
    config: PipelineConfig,
    mode: RunMode,
    report_path: Option<&Path>,
    json: bool,
) -> Result<ExitCode> {
    let pipeline = CriticalPipeline::new(config).context("Invalid pipeline configuration")?;
    info!(run_id = %pipeline.run_id(), ?mode, "starting critical CSS pipeline");

    let shutdown = shutdown_signal()?;
    let summary = pipeline.run_with_shutdown(mode, shutdown).await;

    if let (Some(path), Some(report)) = (report_path, &summary.report) {
        write_report_json(path, report)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(path = %path.display(), "wrote performance report");
    }

    print_summary(&summary, json)?;
    Ok(ExitCode::from(exit_status(summary.exit_code())))
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    if let Some(report) = &summary.report {
        println!("{}", report.render_text());
    }
    for document in &summary.documents {
        println!(
            "  injected {} ({} bytes, {} links deferred)",
            document.path.display(),
            document.stats.inlined_bytes,
            document.stats.links_deferred
        );
    }
    for sheet in &summary.stylesheets {
        println!(
            "  reduced {} {} -> {} bytes ({} rules removed)",
            sheet.path.display(),
            sheet.original_bytes,
            sheet.reduced_bytes,
            sheet.removed_rules
        );
    }
    println!("Critical CSS {}", summary.outcome);
    Ok(())
}

fn cmd_analyze(config: &PipelineConfig, json: bool) -> Result<ExitCode> {
    let report = analyze_build(
        &config.dist_path(),
        &config.routes,
        config.budget.max_critical_bytes,
    )
    .context("Failed to analyze build output")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_serve(config: &PipelineConfig, addr: SocketAddr) -> Result<ExitCode> {
    let shutdown = shutdown_signal()?;
    inspect::serve(addr, config.combined_path(), async move {
        let signal = shutdown.await;
        info!(%signal, "stopping inspection server");
    })
    .await
    .with_context(|| format!("Failed to serve on {addr}"))?;
    Ok(ExitCode::SUCCESS)
}

/// Exit codes outside `0..=255` become a generic failure.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
