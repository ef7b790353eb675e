//! Owned handle to a running preview server.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::error::{PreviewError, Result};

/// A preview server the pipeline talks to.
///
/// Spawned servers run in their own process group. [`ServerHandle::shutdown`]
/// sends SIGTERM to the group, waits for the grace window, then sends SIGKILL.
/// A handle dropped without `shutdown` kills the group immediately. Reused
/// servers belong to someone else and are never signalled.
#[derive(Debug)]
pub struct ServerHandle {
    child: Option<Child>,
    port: u16,
    base_url: String,
    grace: Duration,
}

impl ServerHandle {
    /// Spawn `argv` in `working_dir` as the leader of a new process group.
    ///
    /// Does not wait for readiness.
    pub fn spawn(
        argv: &[String],
        working_dir: &Path,
        port: u16,
        base_url: String,
        grace: Duration,
    ) -> Result<Self> {
        let (exe, args) = argv.split_first().ok_or(PreviewError::EmptyCommand)?;

        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(PreviewError::Spawn)?;
        debug!(pid = ?child.id(), port, command = %argv.join(" "), "spawned preview server");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, port));
        }

        Ok(Self {
            child: Some(child),
            port,
            base_url,
            grace,
        })
    }

    /// A handle for a server that was already running before we looked.
    pub fn reused(port: u16, base_url: String) -> Self {
        Self {
            child: None,
            port,
            base_url,
            grace: Duration::ZERO,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether this handle owns (and will stop) the server process.
    pub fn is_owned(&self) -> bool {
        self.child.is_some()
    }

    /// Pid of the owned server process, if it has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Exit status if the owned process has already exited.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    /// Stop the server. Safe to call repeatedly; later calls are no-ops.
    ///
    /// If signalling the process group fails, any process still holding the
    /// port is killed instead.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let stopped = match child.id() {
            Some(pid) => terminate_group(&mut child, pid, self.grace).await,
            None => Ok(()),
        };

        if let Err(err) = stopped {
            warn!(port = self.port, error = %err, "signalling preview server failed, killing port holders");
            kill_port_holders(self.port).await?;
        }

        info!(event = "server.stopped", port = self.port);
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(pid) = self.pid() {
            warn!(pid, port = self.port, "preview server handle dropped while running, killing");
            if let Err(err) = killpg(to_pid(pid), Signal::SIGKILL) {
                debug!(pid, error = %err, "killpg on drop failed");
            }
        }
    }
}

fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

async fn terminate_group(child: &mut Child, pid: u32, grace: Duration) -> Result<()> {
    let group = to_pid(pid);
    match killpg(group, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            child.wait().await?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!(pid, ?status, "preview server exited after SIGTERM");
        }
        Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "preview server ignored SIGTERM, sending SIGKILL");
            match killpg(group, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => return Err(err.into()),
            }
            child.wait().await?;
        }
    }
    Ok(())
}

/// Kill every process listening on `port`, as reported by `lsof`.
///
/// Last resort when the owned process group cannot be signalled.
pub async fn kill_port_holders(port: u16) -> Result<()> {
    let output = match Command::new("lsof")
        .args(["-t", "-i", &format!("tcp:{port}"), "-sTCP:LISTEN"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output,
        Err(err) => {
            warn!(port, error = %err, "lsof unavailable, cannot clear port");
            return Ok(());
        }
    };

    for pid in String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
    {
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => info!(pid, port, "killed process holding preview port"),
            Err(Errno::ESRCH) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn forward_stderr(stderr: ChildStderr, port: u16) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains("EADDRINUSE") {
            warn!(port, "preview server reports port already in use");
        }
        debug!(port, line = %line, "preview server stderr");
    }
}
