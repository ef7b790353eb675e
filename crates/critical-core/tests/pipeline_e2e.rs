//! Full pipeline runs against a fixture build output, a loopback HTTP
//! responder standing in for the preview server and a shell extraction
//! engine standing in for the browser.

use std::path::Path;

use critical_core::config::EngineKind;
use critical_core::{
    CriticalPipeline, PipelineConfig, PipelineOutcome, PipelineState, Route, RunMode, Viewport,
};
use preview_server::ServerConfig;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const MAIN_CSS: &str = "html{margin:0;padding:0}
body{font-family:system-ui;margin:0}
.container{max-width:1200px;margin:0 auto}
.btn:hover{opacity:.8}
.footer{padding:2rem;background:#222}
";

const PAGE: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8">
    <title>Site</title>
    <link rel="stylesheet" crossorigin href="/assets/index-a1b2.css">
  </head>
  <body><div id="app"></div></body>
</html>
"#;

/// Prints route-specific critical CSS and ignores the stylesheet on stdin.
const ENGINE_SCRIPT: &str = "cat >/dev/null; printf '%s' '.container{max-width:1200px;margin:0 auto}.btn:hover{opacity:.8}.hero-{route}{min-height:60vh}'";

async fn serve_ok(listener: TcpListener) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await;
        });
    }
}

/// A running responder; its port is reused as the preview server.
async fn preview_responder() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_ok(listener));
    port
}

fn write_site(root: &Path) {
    std::fs::create_dir_all(root.join("dist/assets")).unwrap();
    std::fs::write(root.join("dist/assets/index-a1b2.css"), MAIN_CSS).unwrap();
    std::fs::write(root.join("dist/index.html"), PAGE).unwrap();
    std::fs::write(root.join("dist/about.html"), PAGE).unwrap();
}

fn config(root: &Path, port: u16, engine_script: &str) -> PipelineConfig {
    let mut config = PipelineConfig::default()
        .with_root(root)
        .with_routes(vec![Route::new("/"), Route::new("/about")])
        .with_viewports(vec![
            Viewport::new("mobile", 375, 667),
            Viewport::new("desktop", 1300, 900),
        ]);
    config.server = ServerConfig {
        url_host: "127.0.0.1".to_string(),
        ..ServerConfig::default()
    }
    .with_command(["false"])
    .with_ports(port, 1)
    .with_readiness(20, 50);
    config.build.command = Vec::new();
    config.extract.engine = EngineKind::Command;
    config.extract.command = vec!["sh".into(), "-c".into(), engine_script.into()];
    config.extract.timeout_ms = 10_000;
    config.keep_scratch = false;
    config
}

async fn fixture() -> (TempDir, u16) {
    let dir = tempfile::tempdir().unwrap();
    write_site(dir.path());
    (dir, preview_responder().await)
}

#[tokio::test]
async fn test_full_run_produces_every_fragment() {
    let (dir, port) = fixture().await;
    let root = dir.path();

    let pipeline = CriticalPipeline::new(config(root, port, ENGINE_SCRIPT)).unwrap();
    let summary = pipeline.run(RunMode::Full).await;

    assert_eq!(summary.outcome, PipelineOutcome::Completed);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        summary.fragments,
        vec!["home-mobile", "home-desktop", "about-mobile", "about-desktop"]
    );
    assert_eq!(
        summary.states,
        vec![
            PipelineState::Init,
            PipelineState::ServerStarting,
            PipelineState::ServerReady,
            PipelineState::Building,
            PipelineState::Extracting,
            PipelineState::Combining,
            PipelineState::Injecting,
            PipelineState::Reducing,
            PipelineState::Reporting,
            PipelineState::Cleanup,
            PipelineState::Done,
        ]
    );

    for page in ["index.html", "about.html"] {
        let html = std::fs::read_to_string(root.join("dist").join(page)).unwrap();
        assert_eq!(html.matches("<style data-critical").count(), 1);
        assert!(html.contains(".hero-home{min-height:60vh}.hero-about{min-height:60vh}"));
        assert!(html.contains(r#"<link rel="preload" href="/assets/index-a1b2.css" as="style""#));
        assert!(html.contains("<noscript data-critical-fallback>"));
    }
    assert_eq!(summary.documents.len(), 2);

    let main = std::fs::read_to_string(root.join("dist/assets/index-a1b2.css")).unwrap();
    assert!(!main.contains(".container{"));
    assert!(main.contains(".btn:hover{opacity:.8}"));
    assert!(main.contains(".footer{padding:2rem;background:#222}"));

    let report = summary.report.unwrap();
    assert_eq!(report.original_css_bytes, MAIN_CSS.len() as u64);
    assert!(report.original_css_bytes >= report.reduced_main_css_bytes);
    assert_eq!(report.reduced_main_css_bytes, main.len() as u64);
    assert_eq!(report.extracted, 4);
    assert!(report.critical_css_sha256.is_some());

    // scratch files are gone after cleanup
    let leftovers = std::fs::read_dir(root.join("critical")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_rerun_does_not_duplicate_injection() {
    let (dir, port) = fixture().await;
    let root = dir.path();

    for _ in 0..2 {
        let summary = CriticalPipeline::new(config(root, port, ENGINE_SCRIPT))
            .unwrap()
            .run(RunMode::Full)
            .await;
        assert!(summary.outcome.is_success());
    }

    let html = std::fs::read_to_string(root.join("dist/index.html")).unwrap();
    assert_eq!(html.matches("<style data-critical").count(), 1);
    assert_eq!(html.matches("Content-Security-Policy").count(), 1);
    assert_eq!(html.matches("<noscript data-critical-fallback>").count(), 1);
    assert_eq!(html.matches("critical-css-size").count(), 1);
}

#[tokio::test]
async fn test_failed_combinations_are_skipped() {
    let (dir, port) = fixture().await;
    let script = format!("[ {{route}} != about ] || exit 1; {ENGINE_SCRIPT}");

    let summary = CriticalPipeline::new(config(dir.path(), port, &script))
        .unwrap()
        .run(RunMode::Full)
        .await;

    assert_eq!(summary.outcome, PipelineOutcome::CompletedWithSkips { skipped: 2 });
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.fragments, vec!["home-mobile", "home-desktop"]);
    let report = summary.report.unwrap();
    assert_eq!(report.extracted, 2);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn test_missing_build_artifacts_fail_at_building() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("dist")).unwrap();
    std::fs::write(root.join("dist/index.html"), PAGE).unwrap();
    let port = preview_responder().await;

    let mut config = config(root, port, ENGINE_SCRIPT);
    config.build.command = vec!["sh".into(), "-c".into(), "exit 0".into()];

    let summary = CriticalPipeline::new(config).unwrap().run(RunMode::Full).await;

    assert!(matches!(
        summary.outcome,
        PipelineOutcome::Failed { stage: PipelineState::Building, .. }
    ));
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.report.is_none());
    assert!(!summary.states.contains(&PipelineState::Extracting));
    assert_eq!(summary.states.last(), Some(&PipelineState::Failed));

    let html = std::fs::read_to_string(root.join("dist/index.html")).unwrap();
    assert_eq!(html, PAGE);
}

#[tokio::test]
async fn test_build_retries_with_plugin_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("dist")).unwrap();
    std::fs::write(root.join("dist/index.html"), PAGE).unwrap();
    let port = preview_responder().await;

    let build = format!(
        "[ \"$CRITICAL_CSS_PLUGIN_DISABLED\" = true ] || exit 0; \
         mkdir -p dist/assets && printf '%s' '{}' > dist/assets/index-a1b2.css",
        MAIN_CSS.replace('\n', "")
    );
    let mut config = config(root, port, ENGINE_SCRIPT);
    config.build.command = vec!["sh".into(), "-c".into(), build];

    let summary = CriticalPipeline::new(config).unwrap().run(RunMode::Full).await;

    assert_eq!(summary.outcome, PipelineOutcome::Completed);
    assert!(std::env::var("CRITICAL_CSS_PLUGIN_DISABLED").is_err());
    assert!(std::env::var("CRITICAL_CSS_BUILD").is_err());
}

#[tokio::test]
async fn test_injection_failure_still_reports() {
    let (dir, port) = fixture().await;
    let root = dir.path();
    std::fs::write(root.join("dist/index.html"), "<html><body>no head</body></html>").unwrap();

    let summary = CriticalPipeline::new(config(root, port, ENGINE_SCRIPT))
        .unwrap()
        .run(RunMode::Full)
        .await;

    assert!(matches!(
        summary.outcome,
        PipelineOutcome::Failed { stage: PipelineState::Injecting, .. }
    ));
    assert!(summary.report.is_some());
    assert!(summary.states.contains(&PipelineState::Reporting));
    assert!(!summary.states.contains(&PipelineState::Reducing));
    assert_eq!(
        summary
            .states
            .iter()
            .filter(|state| **state == PipelineState::Cleanup)
            .count(),
        1
    );

    let main = std::fs::read_to_string(root.join("dist/assets/index-a1b2.css")).unwrap();
    assert_eq!(main, MAIN_CSS);
}
