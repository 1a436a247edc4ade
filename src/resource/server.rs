//! Protected resource server

use std::future::Future;
use std::sync::Arc;

use axum::{
    Extension, Json, Router, middleware,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::gate::{RequestGate, gate_middleware};
use super::validator::ValidatedPrincipal;
use crate::config::ResourceConfig;
use crate::{Error, Result};

/// Build the router: `/data` and `/health`, both behind the gate unless
/// listed as public
pub fn create_router(gate: Arc<RequestGate>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/data", get(data_handler))
        .layer(middleware::from_fn_with_state(gate, gate_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "version": env!("CARGO_PKG_VERSION") }))
}

async fn data_handler(Extension(principal): Extension<ValidatedPrincipal>) -> impl IntoResponse {
    format!("Protected data for {}", principal.subject)
}

/// Resource server bound to the configured address
pub struct ResourceServer {
    config: ResourceConfig,
    gate: Arc<RequestGate>,
}

impl ResourceServer {
    /// Create a server
    pub fn new(config: ResourceConfig, gate: Arc<RequestGate>) -> Self {
        Self { config, gate }
    }

    /// Bind and serve until Ctrl+C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!(host = %self.config.host, port = self.config.port, "Resource server listening");
        info!(public_paths = ?self.config.public_paths, "Public paths");

        serve(listener, self.gate, shutdown_signal()).await
    }
}

/// Serve on an already bound listener until `shutdown` completes
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, gate: Arc<RequestGate>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, create_router(gate))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Resource server stopped");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
