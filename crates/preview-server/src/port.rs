//! Port selection.
//!
//! Ports are probed one at a time from a base port upward. A probe classifies
//! the port as free (a transient listener could bind), running (something
//! already answers HTTP there) or busy.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{PreviewError, Result};

/// Outcome of probing one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Nothing is listening; a new server may bind here.
    Free,
    /// A server already answers HTTP here and can be reused.
    Running,
    /// Occupied by something we cannot use.
    Busy,
}

/// Probe `attempts` ports starting at `base`, stopping at the first port that
/// is not [`PortState::Busy`].
///
/// The probe is called exactly once per port and never twice for the same
/// port. A window that would run past `u16::MAX` is truncated, and the
/// error then reports the number of ports actually probed.
pub async fn scan_ports<F, Fut>(base: u16, attempts: u16, mut probe: F) -> Result<(u16, PortState)>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = PortState>,
{
    let mut probed = 0;
    for offset in 0..attempts {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        probed += 1;
        match probe(port).await {
            PortState::Busy => debug!(port, "port busy"),
            state => {
                debug!(port, ?state, "port selected");
                return Ok((port, state));
            }
        }
    }
    Err(PreviewError::PortExhausted {
        base,
        attempts: probed,
    })
}

/// Whether a listener can bind `host:port` right now. The listener is closed
/// before returning.
pub async fn is_port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).await.is_ok()
}

/// First port in the window that a transient listener can bind.
pub async fn find_available_port(host: &str, base: u16, attempts: u16) -> Result<u16> {
    let (port, _) = scan_ports(base, attempts, |port| async move {
        if is_port_free(host, port).await {
            PortState::Free
        } else {
            PortState::Busy
        }
    })
    .await?;
    Ok(port)
}

/// Whether `url` answers a GET with a 2xx status.
pub async fn is_http_ready(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            debug!(url, error = %err, "readiness probe failed");
            false
        }
    }
}

/// HTTP client used for readiness and reuse probes.
pub fn probe_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()?)
}
