//! RPC listener: one task per connection, requests answered in order.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::net::{TcpListener, TcpStream};

use xpkg_core::{ExtensionError, PluginOperations, Result};

use crate::config::MAX_UPLOAD_SIZE;

use super::protocol::{read_frame, write_frame, FrameError, RpcBody, RpcRequest, RpcResponse};

pub struct RpcServer {
    service: Arc<dyn PluginOperations>,
}

impl RpcServer {
    pub fn new(service: Arc<dyn PluginOperations>) -> Self {
        Self { service }
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "RPC listener started");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = self.service.clone();
                        tokio::spawn(async move {
                            handle_connection(service, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept RPC connection");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("RPC listener stopping");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(service: Arc<dyn PluginOperations>, mut stream: TcpStream, peer: SocketAddr) {
    tracing::debug!(peer = %peer, "RPC connection opened");
    loop {
        let request: RpcRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(FrameError::Closed) => break,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Dropping RPC connection");
                break;
            }
        };

        let operation = request.operation();
        let response = dispatch(service.as_ref(), request).await;
        if let Some(error) = &response.error {
            tracing::debug!(peer = %peer, operation, code = %error.code, "RPC request refused");
        }
        if let Err(e) = write_frame(&mut stream, &response).await {
            tracing::warn!(peer = %peer, operation, error = %e, "Failed to write RPC response");
            break;
        }
    }
    tracing::debug!(peer = %peer, "RPC connection closed");
}

/// Run one request against `service`.
pub async fn dispatch(service: &dyn PluginOperations, request: RpcRequest) -> RpcResponse {
    match execute(service, request).await {
        Ok(body) => RpcResponse::ok(body),
        Err(e) => RpcResponse::failed(&e),
    }
}

async fn execute(service: &dyn PluginOperations, request: RpcRequest) -> Result<RpcBody> {
    let body = match request {
        RpcRequest::UploadPlugin { filename, content } => {
            if content.len() > MAX_UPLOAD_SIZE {
                return Err(ExtensionError::Validation(format!(
                    "upload of {} bytes exceeds the {} byte limit",
                    content.len(),
                    MAX_UPLOAD_SIZE
                )));
            }
            RpcBody::Uploaded(service.upload_plugin(&filename, content).await?)
        }
        RpcRequest::ListPlugins => RpcBody::Plugins(service.list_plugins().await?),
        RpcRequest::GetModels { plugin_id, api_key } => {
            let catalog = service.get_models(&plugin_id, api_key.as_deref()).await?;
            RpcBody::Models(catalog.into_iter().collect())
        }
        RpcRequest::EnablePlugin { plugin_id } => {
            service.enable_plugin(&plugin_id).await?;
            RpcBody::Done
        }
        RpcRequest::DisablePlugin { plugin_id } => {
            service.disable_plugin(&plugin_id).await?;
            RpcBody::Done
        }
        RpcRequest::DeletePlugin { plugin_id } => {
            service.delete_plugin(&plugin_id).await?;
            RpcBody::Done
        }
        RpcRequest::Embed { plugin_id, text } => RpcBody::Embedding(service.embed(&plugin_id, &text).await?),
        RpcRequest::EmbedBatch { plugin_id, texts } => {
            RpcBody::Embeddings(service.embed_batch(&plugin_id, &texts).await?)
        }
        RpcRequest::Rerank {
            plugin_id,
            query,
            documents,
        } => RpcBody::Reranked(service.rerank(&plugin_id, &query, &documents).await?),
        RpcRequest::GetPluginConfig { plugin_id } => {
            let view = service.get_plugin_config(&plugin_id).await?;
            RpcBody::Config {
                plugin_id: view.plugin_id,
                enabled: view.enabled,
                settings_json: serde_json::to_string(&view.settings)?,
            }
        }
        RpcRequest::UpdatePluginConfig {
            plugin_id,
            settings_json,
        } => {
            let settings: Map<String, Value> = serde_json::from_str(&settings_json)
                .map_err(|e| ExtensionError::Validation(format!("settings must be a JSON object: {}", e)))?;
            service.update_plugin_config(&plugin_id, settings).await?;
            RpcBody::Done
        }
    };
    Ok(body)
}
