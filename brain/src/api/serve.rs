//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::handlers::{
    activate_site, deployment_logs, healthz, onboard_server, submit_deployment, ApiContext,
};
use crate::errors::PanelError;

/// Request bodies are limited to 1 MiB before any decoding happens.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the router; exposed separately so tests can drive it without a
/// listener.
pub fn router(context: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/v1/sites/activate", post(activate_site))
        .route("/v1/servers/onboard", post(onboard_server))
        .route("/v1/deployments", post(submit_deployment))
        .route("/v1/deployments/:id/logs", get(deployment_logs))
        .route("/healthz", get(healthz))
        .with_state(context)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    bind_address: &str,
    context: Arc<ApiContext>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PanelError>>, PanelError> {
    let app = router(context);

    info!("Starting HTTP server on {}", bind_address);
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(|e| PanelError::Internal(format!("bind {bind_address}: {e}")))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| PanelError::Internal(e.to_string()))
    });

    Ok(handle)
}
