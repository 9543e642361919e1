//! Fallback transport: JSON over HTTP.
//!
//! ```text
//! GET    /health
//! GET    /api/plugins
//! POST   /api/plugins/upload            multipart field `file`
//! DELETE /api/plugins/:id
//! POST   /api/plugins/:id/models        {"api_key": ...}
//! POST   /api/plugins/:id/enable
//! POST   /api/plugins/:id/disable
//! POST   /api/plugins/:id/embed         {"text": ...}
//! POST   /api/plugins/:id/embed_batch   {"texts": [...]}
//! POST   /api/plugins/:id/rerank        {"query": ..., "documents": [...]}
//! GET    /api/plugins/:id/config
//! PUT    /api/plugins/:id/config        {"settings": {...}}
//! ```

pub mod client;
pub mod error;
pub mod handlers;
pub mod models;

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use xpkg_core::PluginOperations;

use crate::config::MAX_REQUEST_SIZE;
use handlers::*;

pub use client::HttpClient;
pub use error::ErrorResponse;

pub fn create_router(service: Arc<dyn PluginOperations>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/plugins", get(list_plugins_handler))
        .route("/api/plugins/upload", post(upload_plugin_handler))
        .route("/api/plugins/:id", axum::routing::delete(delete_plugin_handler))
        .route("/api/plugins/:id/models", post(get_models_handler))
        .route("/api/plugins/:id/enable", post(enable_plugin_handler))
        .route("/api/plugins/:id/disable", post(disable_plugin_handler))
        .route("/api/plugins/:id/embed", post(embed_handler))
        .route("/api/plugins/:id/embed_batch", post(embed_batch_handler))
        .route("/api/plugins/:id/rerank", post(rerank_handler))
        .route(
            "/api/plugins/:id/config",
            get(get_config_handler).put(update_config_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_REQUEST_SIZE))
        .with_state(AppState { service })
}

/// Serve the router on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    service: Arc<dyn PluginOperations>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "HTTP listener started");
    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(shutdown)
        .await
}
