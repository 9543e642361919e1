//! RPC client over a small pool of connections.

use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::net::TcpStream;

use xpkg_core::extension::{RerankDocument, RerankResult};
use xpkg_core::service::{Embedding, ModelCatalog, PluginConfigView, PluginSummary, UploadReceipt};
use xpkg_core::{ExtensionError, PluginOperations, Result};

use super::protocol::{read_frame, write_frame, FrameError, RpcBody, RpcRequest, RpcResponse};

/// Idle connections kept for reuse.
const MAX_IDLE: usize = 8;

/// Each in-flight call owns one connection, so calls never queue behind each
/// other. Connections go back to the idle pool after a clean exchange and are
/// dropped after any transport failure or timeout.
pub struct RpcClient {
    target: String,
    timeout: Duration,
    idle: Mutex<Vec<TcpStream>>,
}

async fn open(target: &str, limit: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(limit, TcpStream::connect(target))
        .await
        .map_err(|_| ExtensionError::Transport(format!("connecting to {} timed out", target)))?
        .map_err(|e| ExtensionError::Transport(format!("cannot connect to {}: {}", target, e)))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr = %target, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

async fn exchange(stream: &mut TcpStream, request: &RpcRequest) -> std::result::Result<RpcResponse, FrameError> {
    write_frame(stream, request).await?;
    read_frame(stream).await
}

fn unexpected(operation: &str, body: &RpcBody) -> ExtensionError {
    ExtensionError::Transport(format!("unexpected response to {}: {:?}", operation, body))
}

impl RpcClient {
    /// Open the channel, failing if it cannot be established within `connect_timeout`.
    pub async fn connect(target: &str, connect_timeout: Duration, timeout: Duration) -> Result<Self> {
        let stream = open(target, connect_timeout).await?;
        tracing::debug!(addr = %target, "RPC channel open");
        Ok(Self {
            target: target.to_string(),
            timeout,
            idle: Mutex::new(vec![stream]),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn call(&self, request: RpcRequest) -> Result<RpcBody> {
        self.call_with_deadline(request, self.timeout).await
    }

    /// Send `request` and wait at most `deadline` for the answer, connecting
    /// included.
    pub async fn call_with_deadline(&self, request: RpcRequest, deadline: Duration) -> Result<RpcBody> {
        let operation = request.operation();
        match tokio::time::timeout(deadline, self.round_trip(&request, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(ExtensionError::Transport(format!(
                "{} timed out after {}s",
                operation,
                deadline.as_secs_f32()
            ))),
        }
    }

    async fn round_trip(&self, request: &RpcRequest, deadline: Duration) -> Result<RpcBody> {
        let pooled = self.idle.lock().pop();
        if let Some(mut stream) = pooled {
            match exchange(&mut stream, request).await {
                Ok(response) => {
                    self.release(stream);
                    return response.into_body();
                }
                // The server closed an idle connection before reading the request
                Err(FrameError::Closed) => {
                    tracing::debug!(addr = %self.target, "Pooled RPC connection closed, reconnecting");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut stream = open(&self.target, deadline).await?;
        let response = exchange(&mut stream, request).await?;
        self.release(stream);
        response.into_body()
    }

    fn release(&self, stream: TcpStream) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(stream);
        }
    }

    async fn call_done(&self, request: RpcRequest) -> Result<()> {
        let operation = request.operation();
        match self.call(request).await? {
            RpcBody::Done => Ok(()),
            other => Err(unexpected(operation, &other)),
        }
    }
}

#[async_trait::async_trait]
impl PluginOperations for RpcClient {
    async fn upload_plugin(&self, filename: &str, content: Vec<u8>) -> Result<UploadReceipt> {
        let request = RpcRequest::UploadPlugin {
            filename: filename.to_string(),
            content,
        };
        match self.call(request).await? {
            RpcBody::Uploaded(receipt) => Ok(receipt),
            other => Err(unexpected("UploadPlugin", &other)),
        }
    }

    async fn list_plugins(&self) -> Result<Vec<PluginSummary>> {
        match self.call(RpcRequest::ListPlugins).await? {
            RpcBody::Plugins(plugins) => Ok(plugins),
            other => Err(unexpected("ListPlugins", &other)),
        }
    }

    async fn get_models(&self, plugin_id: &str, api_key: Option<&str>) -> Result<ModelCatalog> {
        let request = RpcRequest::GetModels {
            plugin_id: plugin_id.to_string(),
            api_key: api_key.map(str::to_string),
        };
        match self.call(request).await? {
            RpcBody::Models(pairs) => Ok(pairs.into_iter().collect()),
            other => Err(unexpected("GetModels", &other)),
        }
    }

    async fn enable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.call_done(RpcRequest::EnablePlugin {
            plugin_id: plugin_id.to_string(),
        })
        .await
    }

    async fn disable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.call_done(RpcRequest::DisablePlugin {
            plugin_id: plugin_id.to_string(),
        })
        .await
    }

    async fn delete_plugin(&self, plugin_id: &str) -> Result<()> {
        self.call_done(RpcRequest::DeletePlugin {
            plugin_id: plugin_id.to_string(),
        })
        .await
    }

    async fn embed(&self, plugin_id: &str, text: &str) -> Result<Embedding> {
        let request = RpcRequest::Embed {
            plugin_id: plugin_id.to_string(),
            text: text.to_string(),
        };
        match self.call(request).await? {
            RpcBody::Embedding(embedding) => Ok(embedding),
            other => Err(unexpected("Embed", &other)),
        }
    }

    async fn embed_batch(&self, plugin_id: &str, texts: &[String]) -> Result<Vec<Embedding>> {
        let request = RpcRequest::EmbedBatch {
            plugin_id: plugin_id.to_string(),
            texts: texts.to_vec(),
        };
        match self.call(request).await? {
            RpcBody::Embeddings(embeddings) => Ok(embeddings),
            other => Err(unexpected("EmbedBatch", &other)),
        }
    }

    async fn rerank(
        &self,
        plugin_id: &str,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RerankResult>> {
        let request = RpcRequest::Rerank {
            plugin_id: plugin_id.to_string(),
            query: query.to_string(),
            documents: documents.to_vec(),
        };
        match self.call(request).await? {
            RpcBody::Reranked(results) => Ok(results),
            other => Err(unexpected("Rerank", &other)),
        }
    }

    async fn get_plugin_config(&self, plugin_id: &str) -> Result<PluginConfigView> {
        let request = RpcRequest::GetPluginConfig {
            plugin_id: plugin_id.to_string(),
        };
        match self.call(request).await? {
            RpcBody::Config {
                plugin_id,
                enabled,
                settings_json,
            } => Ok(PluginConfigView {
                plugin_id,
                enabled,
                settings: serde_json::from_str(&settings_json)?,
            }),
            other => Err(unexpected("GetPluginConfig", &other)),
        }
    }

    async fn update_plugin_config(&self, plugin_id: &str, settings: Map<String, Value>) -> Result<()> {
        self.call_done(RpcRequest::UpdatePluginConfig {
            plugin_id: plugin_id.to_string(),
            settings_json: serde_json::to_string(&settings)?,
        })
        .await
    }
}
