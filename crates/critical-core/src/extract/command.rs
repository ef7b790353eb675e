//! External command extraction engine.

use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CriticalEngine, ExtractRequest};

/// Delegates extraction to an external program.
///
/// Each argument may contain `{url}`, `{width}`, `{height}`, `{viewport}` and
/// `{route}`. The stylesheet is written to the program's stdin and its stdout
/// is taken as the critical CSS. A non-zero exit is an extraction failure.
pub struct CommandEngine {
    command: Vec<String>,
}

impl CommandEngine {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn render_args(&self, request: &ExtractRequest) -> Vec<String> {
        let width = request.viewport.width.to_string();
        let height = request.viewport.height.to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{url}", &request.url)
                    .replace("{width}", &width)
                    .replace("{height}", &height)
                    .replace("{viewport}", &request.viewport.name)
                    .replace("{route}", &request.route.name)
            })
            .collect()
    }
}

#[async_trait]
impl CriticalEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    async fn extract(&self, request: &ExtractRequest) -> anyhow::Result<String> {
        let argv = self.render_args(request);
        let Some((exe, args)) = argv.split_first() else {
            bail!("extraction command is empty");
        };

        let mut child = Command::new(exe)
            .args(args)
            .env("CRITICAL_USER_AGENT", &request.user_agent)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {exe}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            let stylesheet = request.stylesheet.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(stylesheet.as_bytes()).await;
            });
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "{exe} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
