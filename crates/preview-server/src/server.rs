//! Preview server manager.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{PreviewError, Result};
use crate::handle::ServerHandle;
use crate::port::{is_http_ready, is_port_free, probe_client, scan_ports, PortState};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Starts and stops the preview server for one pipeline run.
///
/// At most one server is held at a time. [`PreviewServer::stop`] is
/// idempotent and may be called before `start`.
pub struct PreviewServer {
    config: ServerConfig,
    working_dir: PathBuf,
    dist_dir: PathBuf,
    client: reqwest::Client,
    handle: Option<ServerHandle>,
}

impl PreviewServer {
    /// Create a manager serving `dist_dir`, running the command from `working_dir`.
    pub fn new(
        config: ServerConfig,
        working_dir: impl Into<PathBuf>,
        dist_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            working_dir: working_dir.into(),
            dist_dir: dist_dir.into(),
            client: probe_client(PROBE_TIMEOUT)?,
            handle: None,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The current server, if started.
    pub fn handle(&self) -> Option<&ServerHandle> {
        self.handle.as_ref()
    }

    /// Start the server, or return the one already held.
    ///
    /// Ports are probed from `base_port`. A port where a server already
    /// answers HTTP is reused when `reuse_running` is set; otherwise the
    /// command is spawned on the first free port and polled until it answers.
    pub async fn start(&mut self) -> Result<&ServerHandle> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => self.launch().await?,
        };
        Ok(self.handle.insert(handle))
    }

    /// Stop the held server. No-op when nothing is held.
    pub async fn stop(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(mut handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    async fn launch(&self) -> Result<ServerHandle> {
        let (port, state) = scan_ports(self.config.base_port, self.config.port_attempts, |port| {
            self.probe(port)
        })
        .await?;
        let base_url = self.config.base_url(port);

        if state == PortState::Running {
            info!(event = "server.ready", port, url = %base_url, reused = true);
            return Ok(ServerHandle::reused(port, base_url));
        }

        let argv = self.config.render_command(port, &self.dist_dir);
        let mut handle = ServerHandle::spawn(
            &argv,
            &self.working_dir,
            port,
            base_url,
            Duration::from_millis(self.config.shutdown_grace_ms),
        )?;

        if let Err(err) = self.wait_until_ready(&mut handle).await {
            if let Err(stop_err) = handle.shutdown().await {
                warn!(port, error = %stop_err, "failed to stop preview server after start failure");
            }
            return Err(err);
        }
        Ok(handle)
    }

    async fn probe(&self, port: u16) -> PortState {
        if self.config.reuse_running
            && is_http_ready(&self.client, &self.config.base_url(port)).await
        {
            return PortState::Running;
        }
        if is_port_free(&self.config.bind_host, port).await {
            PortState::Free
        } else {
            PortState::Busy
        }
    }

    /// Poll the handle's base URL until it answers 2xx.
    pub async fn wait_until_ready(&self, handle: &mut ServerHandle) -> Result<()> {
        let interval = Duration::from_millis(self.config.ready_interval_ms);
        let attempts = self.config.ready_attempts;

        for attempt in 1..=attempts {
            if let Some(status) = handle.try_exit_status()? {
                return Err(PreviewError::ExitedEarly {
                    code: status.code(),
                });
            }
            if is_http_ready(&self.client, handle.base_url()).await {
                info!(event = "server.ready", port = handle.port(), url = %handle.base_url(), attempt);
                return Ok(());
            }
            debug!(attempt, attempts, "preview server not ready yet");
            tokio::time::sleep(interval).await;
        }

        Err(PreviewError::StartTimeout {
            url: handle.base_url().to_string(),
            attempts,
        })
    }
}
