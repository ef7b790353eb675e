//! Preview server configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// How to find a port for, launch, probe and stop the preview server.
///
/// Every field has a default, so a partial JSON object deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface used for bind probes.
    pub bind_host: String,
    /// Host name used in the base URL handed to the extractor.
    pub url_host: String,
    /// First port probed.
    pub base_port: u16,
    /// Size of the probe window.
    pub port_attempts: u16,
    /// Readiness probes before giving up.
    pub ready_attempts: u32,
    /// Delay between readiness probes.
    pub ready_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL.
    pub shutdown_grace_ms: u64,
    /// Command template; `{port}` and `{dist}` are substituted per argument.
    pub command: Vec<String>,
    /// Reuse a server that already answers HTTP on a probed port.
    pub reuse_running: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            url_host: "localhost".to_string(),
            base_port: 4173,
            port_attempts: 20,
            ready_attempts: 30,
            ready_interval_ms: 1000,
            shutdown_grace_ms: 2000,
            command: ["npm", "run", "preview", "--", "--port", "{port}", "--strictPort"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            reuse_running: true,
        }
    }
}

impl ServerConfig {
    /// Set the command template.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the first probed port and window size.
    pub fn with_ports(mut self, base_port: u16, attempts: u16) -> Self {
        self.base_port = base_port;
        self.port_attempts = attempts;
        self
    }

    /// Set readiness polling.
    pub fn with_readiness(mut self, attempts: u32, interval_ms: u64) -> Self {
        self.ready_attempts = attempts;
        self.ready_interval_ms = interval_ms;
        self
    }

    /// Base URL for a server on `port`.
    pub fn base_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.url_host, port)
    }

    /// Expand the command template for `port` and `dist`.
    pub fn render_command(&self, port: u16, dist: &Path) -> Vec<String> {
        let port = port.to_string();
        let dist = dist.display().to_string();
        self.command
            .iter()
            .map(|arg| arg.replace("{port}", &port).replace("{dist}", &dist))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.base_port, 4173);
        assert_eq!(config.port_attempts, 20);
        assert_eq!(config.ready_attempts, 30);
        assert_eq!(config.shutdown_grace_ms, 2000);
        assert_eq!(config.base_url(4174), "http://localhost:4174");
    }

    #[test]
    fn test_render_command_substitutes_placeholders() {
        let config = ServerConfig::default()
            .with_command(["serve", "{dist}", "--listen={port}"]);
        let argv = config.render_command(4180, &PathBuf::from("/srv/dist"));
        assert_eq!(argv, vec!["serve", "/srv/dist", "--listen=4180"]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"base_port": 5000}"#).unwrap();
        assert_eq!(config.base_port, 5000);
        assert_eq!(config.port_attempts, 20);
        assert!(config.reuse_running);
    }
}
