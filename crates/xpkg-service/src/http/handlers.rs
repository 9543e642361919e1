//! HTTP handlers. Each one forwards to [`PluginOperations`].

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::HeaderMap;
use axum::Json;

use xpkg_core::extension::RerankResult;
use xpkg_core::service::{Embedding, ModelCatalog, PluginConfigView, PluginSummary, UploadReceipt};
use xpkg_core::PluginOperations;

use super::error::ErrorResponse;
use super::models::{
    ApiResponse, EmbedBatchRequest, EmbedRequest, HealthStatus, ModelsRequest, PluginAck,
    RerankRequest, UpdateConfigRequest,
};
use crate::config::MAX_UPLOAD_SIZE;

/// Header naming the calling user.
pub const USER_ID_HEADER: &str = "x-user-id";

pub type HandlerResult<T> = Result<Json<ApiResponse<T>>, ErrorResponse>;

fn ok<T: serde::Serialize>(data: T) -> HandlerResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn PluginOperations>,
}

fn caller(headers: &HeaderMap) -> &str {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
}

fn ack(plugin_id: String, message: &str) -> PluginAck {
    PluginAck {
        plugin_id,
        message: message.to_string(),
    }
}

pub async fn health_handler(State(state): State<AppState>) -> HandlerResult<HealthStatus> {
    let plugins = state.service.list_plugins().await?.len();
    ok(HealthStatus {
        status: "ok".to_string(),
        plugins,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /api/plugins`
pub async fn list_plugins_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> HandlerResult<Vec<PluginSummary>> {
    tracing::debug!(user_id = %caller(&headers), "List plugins");
    ok(state.service.list_plugins().await?)
}

/// `POST /api/plugins/upload` with the archive in multipart field `file`.
pub async fn upload_plugin_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> HandlerResult<UploadReceipt> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content = field.bytes().await?;
        upload = Some((filename, content));
        break;
    }

    let Some((filename, content)) = upload else {
        return Err(ErrorResponse::bad_request("missing multipart field `file`"));
    };
    if content.len() > MAX_UPLOAD_SIZE {
        return Err(ErrorResponse::payload_too_large(format!(
            "upload exceeds the {} byte limit",
            MAX_UPLOAD_SIZE
        )));
    }

    tracing::info!(
        user_id = %caller(&headers),
        filename = %filename,
        size = content.len(),
        "Plugin upload"
    );
    ok(state.service.upload_plugin(&filename, content.to_vec()).await?)
}

/// `DELETE /api/plugins/:id`
pub async fn delete_plugin_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<PluginAck> {
    tracing::info!(user_id = %caller(&headers), extension_id = %id, "Plugin delete");
    state.service.delete_plugin(&id).await?;
    ok(ack(id, "plugin deleted"))
}

/// `POST /api/plugins/:id/models`, optional body `{"api_key": ...}`.
pub async fn get_models_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<ModelsRequest>>,
) -> HandlerResult<ModelCatalog> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    ok(state.service.get_models(&id, request.api_key.as_deref()).await?)
}

/// `POST /api/plugins/:id/enable`
pub async fn enable_plugin_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<PluginAck> {
    tracing::info!(user_id = %caller(&headers), extension_id = %id, "Plugin enable");
    state.service.enable_plugin(&id).await?;
    ok(ack(id, "plugin enabled"))
}

/// `POST /api/plugins/:id/disable`
pub async fn disable_plugin_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<PluginAck> {
    tracing::info!(user_id = %caller(&headers), extension_id = %id, "Plugin disable");
    state.service.disable_plugin(&id).await?;
    ok(ack(id, "plugin disabled"))
}

/// `POST /api/plugins/:id/embed`
pub async fn embed_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EmbedRequest>,
) -> HandlerResult<Embedding> {
    ok(state.service.embed(&id, &request.text).await?)
}

/// `POST /api/plugins/:id/embed_batch`
pub async fn embed_batch_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EmbedBatchRequest>,
) -> HandlerResult<Vec<Embedding>> {
    ok(state.service.embed_batch(&id, &request.texts).await?)
}

/// `POST /api/plugins/:id/rerank`
pub async fn rerank_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RerankRequest>,
) -> HandlerResult<Vec<RerankResult>> {
    ok(state
        .service
        .rerank(&id, &request.query, &request.documents)
        .await?)
}

/// `GET /api/plugins/:id/config`, secrets masked.
pub async fn get_config_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<PluginConfigView> {
    ok(state.service.get_plugin_config(&id).await?)
}

/// `PUT /api/plugins/:id/config`. Answers with the updated, masked view.
pub async fn update_config_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateConfigRequest>,
) -> HandlerResult<PluginConfigView> {
    tracing::info!(
        user_id = %caller(&headers),
        extension_id = %id,
        keys = request.settings.len(),
        "Plugin config update"
    );
    state.service.update_plugin_config(&id, request.settings).await?;
    ok(state.service.get_plugin_config(&id).await?)
}
