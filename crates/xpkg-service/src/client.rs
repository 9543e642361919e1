//! Transport-selecting client.
//!
//! The RPC channel is tried once, when the client is created. If it cannot be
//! opened the client talks HTTP for the rest of its life; individual calls
//! never fall back.

use std::sync::Arc;

use serde_json::{Map, Value};

use xpkg_core::extension::{RerankDocument, RerankResult};
use xpkg_core::service::{Embedding, ModelCatalog, PluginConfigView, PluginSummary, UploadReceipt};
use xpkg_core::{PluginOperations, Result};

use crate::config::ClientConfig;
use crate::http::HttpClient;
use crate::rpc::RpcClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Rpc,
    Http,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Http => "http",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct PluginServiceClient {
    transport: Transport,
    inner: Arc<dyn PluginOperations>,
}

impl PluginServiceClient {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        match RpcClient::connect(config.rpc_socket(), config.connect_timeout, config.timeout).await {
            Ok(rpc) => {
                tracing::info!(addr = %config.rpc_socket(), "Plugin service client using RPC");
                Ok(Self {
                    transport: Transport::Rpc,
                    inner: Arc::new(rpc),
                })
            }
            Err(e) => {
                tracing::warn!(
                    addr = %config.rpc_socket(),
                    url = %config.http_base(),
                    error = %e,
                    "RPC unavailable, plugin service client using HTTP"
                );
                Self::http(&config)
            }
        }
    }

    /// `connect` with settings from the environment.
    pub async fn from_env() -> Result<Self> {
        Self::connect(ClientConfig::from_env()).await
    }

    /// HTTP-only client, skipping the RPC attempt.
    pub fn http(config: &ClientConfig) -> Result<Self> {
        let http = HttpClient::new(config.http_base(), config.timeout, config.user_id.clone())?;
        Ok(Self {
            transport: Transport::Http,
            inner: Arc::new(http),
        })
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }
}

#[async_trait::async_trait]
impl PluginOperations for PluginServiceClient {
    async fn upload_plugin(&self, filename: &str, content: Vec<u8>) -> Result<UploadReceipt> {
        self.inner.upload_plugin(filename, content).await
    }

    async fn list_plugins(&self) -> Result<Vec<PluginSummary>> {
        self.inner.list_plugins().await
    }

    async fn get_models(&self, plugin_id: &str, api_key: Option<&str>) -> Result<ModelCatalog> {
        self.inner.get_models(plugin_id, api_key).await
    }

    async fn enable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.inner.enable_plugin(plugin_id).await
    }

    async fn disable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.inner.disable_plugin(plugin_id).await
    }

    async fn delete_plugin(&self, plugin_id: &str) -> Result<()> {
        self.inner.delete_plugin(plugin_id).await
    }

    async fn embed(&self, plugin_id: &str, text: &str) -> Result<Embedding> {
        self.inner.embed(plugin_id, text).await
    }

    async fn embed_batch(&self, plugin_id: &str, texts: &[String]) -> Result<Vec<Embedding>> {
        self.inner.embed_batch(plugin_id, texts).await
    }

    async fn rerank(
        &self,
        plugin_id: &str,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RerankResult>> {
        self.inner.rerank(plugin_id, query, documents).await
    }

    async fn get_plugin_config(&self, plugin_id: &str) -> Result<PluginConfigView> {
        self.inner.get_plugin_config(plugin_id).await
    }

    async fn update_plugin_config(&self, plugin_id: &str, settings: Map<String, Value>) -> Result<()> {
        self.inner.update_plugin_config(plugin_id, settings).await
    }
}
