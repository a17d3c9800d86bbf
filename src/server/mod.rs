//! HTTP API serving the generator.
//!
//! - `GET /` returns a fixed status payload
//! - `POST /generate` accepts a multipart image upload and returns a PNG

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::pipeline::Pipeline;

/// Largest accepted request body.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

pub type SharedState = Arc<Pipeline>;

/// Build the application router around a loaded pipeline.
pub fn router(pipeline: SharedState) -> Router {
    Router::new()
        .route("/", get(routes::status))
        .route("/generate", post(routes::generate))
        .with_state(pipeline)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve until Ctrl-C, then drop the pipeline.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(pipeline: SharedState, addr: SocketAddr) -> std::io::Result<()> {
    tracing::info!(
        "Serving {} generator ({}) on http://{addr}",
        pipeline.backend_name(),
        pipeline.config().model_path().display()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
