//! Extensions served by a remote plugin service.
//!
//! [`RemoteEmbedder`] and [`RemoteReranker`] expose a client as capability
//! traits, so a consumer such as a search pipeline can hold them like any
//! local implementation. [`RemoteHost`] goes one step further: plugged into an
//! [`ExtensionManager`](xpkg_core::ExtensionManager) it uploads each archive
//! to the service and registers a proxy [`RemoteExtension`] locally.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use xpkg_core::archive::ARCHIVE_EXTENSION;
use xpkg_core::extension::{Embedder, Extension, ExtensionConfig, RerankDocument, RerankResult, Reranker};
use xpkg_core::manifest::{CapabilityType, Manifest};
use xpkg_core::registry::ExtensionState;
use xpkg_core::{ExtensionError, ExtensionHost, PluginOperations, Result, StagedPackage};

async fn remote_models(
    client: &dyn PluginOperations,
    plugin_id: &str,
    api_key: &str,
    capability: CapabilityType,
) -> Result<Vec<String>> {
    let mut catalog = client.get_models(plugin_id, Some(api_key)).await?;
    Ok(catalog.remove(capability.as_str()).unwrap_or_default())
}

// ============================================================================
// Capability adapters
// ============================================================================

pub struct RemoteEmbedder {
    client: Arc<dyn PluginOperations>,
    plugin_id: String,
    /// Zero until known
    dimensions: AtomicUsize,
}

impl RemoteEmbedder {
    pub fn new(client: Arc<dyn PluginOperations>, plugin_id: impl Into<String>) -> Self {
        Self {
            client,
            plugin_id: plugin_id.into(),
            dimensions: AtomicUsize::new(0),
        }
    }

    pub fn with_dimensions(self, dimensions: usize) -> Self {
        self.dimensions.store(dimensions, Ordering::Relaxed);
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

#[async_trait::async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.client.embed(&self.plugin_id, text).await?;
        self.dimensions.store(embedding.dimensions, Ordering::Relaxed);
        Ok(embedding.embedding)
    }

    /// Learned from the first answer unless set with [`RemoteEmbedder::with_dimensions`].
    fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::Relaxed)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embeddings = self.client.embed_batch(&self.plugin_id, texts).await?;
        if let Some(first) = embeddings.first() {
            self.dimensions.store(first.dimensions, Ordering::Relaxed);
        }
        Ok(embeddings.into_iter().map(|e| e.embedding).collect())
    }

    async fn models(&self, api_key: &str) -> Result<Vec<String>> {
        remote_models(self.client.as_ref(), &self.plugin_id, api_key, CapabilityType::Embedding).await
    }
}

pub struct RemoteReranker {
    client: Arc<dyn PluginOperations>,
    plugin_id: String,
}

impl RemoteReranker {
    pub fn new(client: Arc<dyn PluginOperations>, plugin_id: impl Into<String>) -> Self {
        Self {
            client,
            plugin_id: plugin_id.into(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

#[async_trait::async_trait]
impl Reranker for RemoteReranker {
    async fn rerank(&self, query: &str, documents: &[RerankDocument]) -> Result<Vec<RerankResult>> {
        self.client.rerank(&self.plugin_id, query, documents).await
    }

    async fn models(&self, api_key: &str) -> Result<Vec<String>> {
        remote_models(self.client.as_ref(), &self.plugin_id, api_key, CapabilityType::Rerank).await
    }
}

// ============================================================================
// Proxy extension
// ============================================================================

/// Local stand-in for an extension running in the plugin service.
///
/// Lifecycle calls are forwarded. `cleanup` only drops the local proxy: the
/// service keeps the extension until it is deleted there.
pub struct RemoteExtension {
    manifest: Manifest,
    client: Arc<dyn PluginOperations>,
    embedder: Option<RemoteEmbedder>,
    reranker: Option<RemoteReranker>,
    ready: AtomicBool,
}

impl RemoteExtension {
    pub fn new(manifest: Manifest, client: Arc<dyn PluginOperations>) -> Self {
        let embedder = manifest
            .has_capability(CapabilityType::Embedding)
            .then(|| RemoteEmbedder::new(client.clone(), manifest.id.clone()));
        let reranker = manifest
            .has_capability(CapabilityType::Rerank)
            .then(|| RemoteReranker::new(client.clone(), manifest.id.clone()));
        if manifest.has_capability(CapabilityType::Chat) {
            tracing::warn!(
                extension_id = %manifest.id,
                "Chat is not served remotely"
            );
        }
        Self {
            manifest,
            client,
            embedder,
            reranker,
            ready: AtomicBool::new(false),
        }
    }

    fn id(&self) -> &str {
        &self.manifest.id
    }

    async fn remote_state(&self) -> Result<Option<ExtensionState>> {
        Ok(self
            .client
            .list_plugins()
            .await?
            .into_iter()
            .find(|plugin| plugin.id == self.manifest.id)
            .map(|plugin| plugin.state))
    }
}

#[async_trait::async_trait]
impl Extension for RemoteExtension {
    fn metadata(&self) -> &Manifest {
        &self.manifest
    }

    async fn initialize(&self, config: &ExtensionConfig) -> Result<()> {
        if !config.settings.is_empty() {
            self.client
                .update_plugin_config(self.id(), config.settings.clone())
                .await?;
        }
        if !config.enabled && self.remote_state().await? == Some(ExtensionState::Active) {
            self.client.disable_plugin(self.id()).await?;
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> Result<()> {
        self.client.enable_plugin(self.id()).await
    }

    async fn disable(&self) -> Result<()> {
        self.client.disable_plugin(self.id()).await
    }

    async fn reload_config(&self, config: &ExtensionConfig) -> Result<()> {
        self.client
            .update_plugin_config(self.id(), config.settings.clone())
            .await
    }

    async fn cleanup(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn as_embedder(&self) -> Option<&dyn Embedder> {
        self.embedder.as_ref().map(|e| e as &dyn Embedder)
    }

    fn as_reranker(&self) -> Option<&dyn Reranker> {
        self.reranker.as_ref().map(|r| r as &dyn Reranker)
    }
}

/// Host that runs extensions in a remote plugin service.
pub struct RemoteHost {
    client: Arc<dyn PluginOperations>,
}

impl RemoteHost {
    pub fn new(client: Arc<dyn PluginOperations>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ExtensionHost for RemoteHost {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn instantiate(&self, package: &StagedPackage<'_>) -> Result<Arc<dyn Extension>> {
        let manifest = package.manifest;
        if manifest.has_capability(CapabilityType::Chat) {
            return Err(ExtensionError::Unsupported {
                id: manifest.id.clone(),
                capability: CapabilityType::Chat.to_string(),
            });
        }
        let content = tokio::fs::read(package.archive_path).await?;
        let filename = format!("{}.{}", manifest.id, ARCHIVE_EXTENSION);

        match self.client.upload_plugin(&filename, content).await {
            Ok(receipt) if receipt.plugin_id != manifest.id => {
                return Err(ExtensionError::Mismatch {
                    manifest: manifest.id.clone(),
                    instance: receipt.plugin_id,
                });
            }
            Ok(_) => {}
            // Already running there, typically from an earlier process
            Err(e) if e.code() == "CONFLICT" => {
                tracing::debug!(extension_id = %manifest.id, "Extension already present remotely");
            }
            Err(e) => return Err(e),
        }

        tracing::info!(extension_id = %manifest.id, "Remote extension attached");
        Ok(Arc::new(RemoteExtension::new(manifest.clone(), self.client.clone())))
    }
}
