//! Preview server lifecycle
//!
//! Locates a port, launches a static preview server for a build output
//! directory (or reuses one already answering there), waits for it to answer
//! HTTP and stops it again, escalating from SIGTERM to SIGKILL.
//!
//! The server process is an owned resource: [`ServerHandle`] kills its process
//! group when dropped, so every exit path releases it.

pub mod config;
pub mod error;
pub mod handle;
pub mod port;
pub mod server;

pub use config::ServerConfig;
pub use error::{PreviewError, Result};
pub use handle::{kill_port_holders, ServerHandle};
pub use port::{find_available_port, is_http_ready, is_port_free, scan_ports, PortState};
pub use server::PreviewServer;
