//! Development endpoint exposing the combined critical stylesheet.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::warn;

pub const PREVIEW_ROUTE: &str = "/critical-css-preview";

#[derive(Debug, Clone)]
pub struct InspectState {
    pub combined_path: Arc<PathBuf>,
}

/// Router serving `GET /critical-css-preview` from `combined_path`.
pub fn router(combined_path: PathBuf) -> Router {
    Router::new()
        .route(PREVIEW_ROUTE, get(critical_css_preview))
        .with_state(InspectState {
            combined_path: Arc::new(combined_path),
        })
}

/// 200 with the stylesheet, 404 before it has been generated, 500 when it
/// cannot be read.
pub async fn critical_css_preview(State(state): State<InspectState>) -> Response {
    match tokio::fs::read_to_string(state.combined_path.as_ref()).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "Critical CSS not generated yet").into_response()
        }
        Err(err) => {
            warn!(path = %state.combined_path.display(), error = %err, "failed to read critical CSS");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error reading critical CSS").into_response()
        }
    }
}

/// Serve [`router`] on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: std::net::SocketAddr, combined_path: PathBuf, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, route = PREVIEW_ROUTE, "serving critical CSS preview");
    axum::serve(listener, router(combined_path))
        .with_graceful_shutdown(shutdown)
        .await
}
