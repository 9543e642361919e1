//! The operation set exposed to other services, and its in-process implementation.
//!
//! Remote transports (RPC and HTTP) serve and consume [`PluginOperations`];
//! [`LocalPluginService`] implements it directly over an [`ExtensionManager`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::archive;
use crate::config::mask_settings;
use crate::error::{ExtensionError, Result};
use crate::extension::{Embedder, RerankDocument, RerankResult, Reranker};
use crate::manager::ExtensionManager;
use crate::manifest::{Capability, CapabilityType};
use crate::registry::{ExtensionState, RegistryEntry};
use crate::store::ObjectStore;

/// Object key prefix under which uploaded archives are kept.
pub const ARCHIVE_PREFIX: &str = "plugins";

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub license: String,
    pub provider: String,
    pub state: ExtensionState,
    pub capabilities: Vec<Capability>,
}

impl From<&RegistryEntry> for PluginSummary {
    fn from(entry: &RegistryEntry) -> Self {
        let m = &entry.manifest;
        Self {
            id: m.id.clone(),
            name: m.name.clone(),
            version: m.version.clone(),
            description: m.description.clone(),
            author: m.author.clone(),
            license: m.license.clone(),
            provider: m.provider.clone(),
            state: entry.state,
            capabilities: m.capabilities.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub plugin_id: String,
    pub filename: String,
    pub message: String,
}

/// Models per capability, keyed `embedding` / `rerank` / `chat`.
pub type ModelCatalog = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub embedding: Vec<f32>,
    pub dimensions: usize,
}

impl From<Vec<f32>> for Embedding {
    fn from(embedding: Vec<f32>) -> Self {
        Self {
            dimensions: embedding.len(),
            embedding,
        }
    }
}

/// Config as shown to callers, secrets masked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfigView {
    pub plugin_id: String,
    pub enabled: bool,
    pub settings: Map<String, Value>,
}

// ============================================================================
// Operations
// ============================================================================

/// Operations served to other services, in-process or over the wire.
#[async_trait::async_trait]
pub trait PluginOperations: Send + Sync {
    async fn upload_plugin(&self, filename: &str, content: Vec<u8>) -> Result<UploadReceipt>;

    async fn list_plugins(&self) -> Result<Vec<PluginSummary>>;

    /// Live listing when `api_key` is given and the extension supports it,
    /// otherwise the models declared in the manifest.
    async fn get_models(&self, plugin_id: &str, api_key: Option<&str>) -> Result<ModelCatalog>;

    async fn enable_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn disable_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn delete_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn embed(&self, plugin_id: &str, text: &str) -> Result<Embedding>;

    async fn embed_batch(&self, plugin_id: &str, texts: &[String]) -> Result<Vec<Embedding>>;

    async fn rerank(
        &self,
        plugin_id: &str,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RerankResult>>;

    async fn get_plugin_config(&self, plugin_id: &str) -> Result<PluginConfigView>;

    /// Merge `settings` over the current ones and reload.
    async fn update_plugin_config(&self, plugin_id: &str, settings: Map<String, Value>) -> Result<()>;
}

// ============================================================================
// Platform classification
// ============================================================================

const PLATFORM_SIGNATURES: [&str; 4] = [
    "not implemented",
    "cannot load",
    "incompatible",
    "cannot open shared object",
];

/// `<os>/<arch>` of the running host.
pub fn host_platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Turn load failures caused by a binary built for another platform into
/// [`ExtensionError::PlatformIncompatible`]; other errors pass through.
pub fn classify_load_error(err: ExtensionError) -> ExtensionError {
    let platform_failure = match &err {
        ExtensionError::NotImplemented(_) => true,
        ExtensionError::Load(_) => {
            let message = err.to_string().to_lowercase();
            PLATFORM_SIGNATURES.iter().any(|s| message.contains(s))
        }
        _ => false,
    };
    if platform_failure {
        ExtensionError::PlatformIncompatible {
            platform: host_platform(),
            message: err.to_string(),
        }
    } else {
        err
    }
}

fn is_plain_archive_name(filename: &str) -> bool {
    let path = Path::new(filename);
    path.file_name().and_then(|n| n.to_str()) == Some(filename) && archive::is_archive(path)
}

// ============================================================================
// Local service
// ============================================================================

/// [`PluginOperations`] over a manager in this process.
pub struct LocalPluginService {
    manager: Arc<ExtensionManager>,
    objects: Arc<dyn ObjectStore>,
    upload_dir: PathBuf,
}

impl LocalPluginService {
    pub fn new(manager: Arc<ExtensionManager>, objects: Arc<dyn ObjectStore>) -> Self {
        let upload_dir = manager.config().temp_dir.join("uploads");
        Self {
            manager,
            objects,
            upload_dir,
        }
    }

    pub fn manager(&self) -> &Arc<ExtensionManager> {
        &self.manager
    }

    async fn entry(&self, plugin_id: &str) -> Result<RegistryEntry> {
        self.manager
            .registry()
            .get(plugin_id)
            .await
            .ok_or_else(|| ExtensionError::NotFound(format!("extension {}", plugin_id)))
    }

    async fn live_models(
        entry: &RegistryEntry,
        capability: CapabilityType,
        api_key: &str,
    ) -> Option<Vec<String>> {
        let result = match capability {
            CapabilityType::Embedding => match entry.instance.as_embedder() {
                Some(embedder) => embedder.models(api_key).await,
                None => return None,
            },
            CapabilityType::Rerank => match entry.instance.as_reranker() {
                Some(reranker) => reranker.models(api_key).await,
                None => return None,
            },
            _ => return None,
        };
        match result {
            Ok(models) => Some(models),
            Err(e) => {
                tracing::debug!(
                    extension_id = %entry.id(),
                    capability = %capability,
                    error = %e,
                    "Live model listing failed, using manifest models"
                );
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl PluginOperations for LocalPluginService {
    async fn upload_plugin(&self, filename: &str, content: Vec<u8>) -> Result<UploadReceipt> {
        if content.is_empty() {
            return Err(ExtensionError::Validation("uploaded file is empty".to_string()));
        }
        if !is_plain_archive_name(filename) {
            return Err(ExtensionError::Validation(format!(
                "invalid file type: {} (expected a .{} archive)",
                filename,
                archive::ARCHIVE_EXTENSION
            )));
        }

        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let staged = self
            .upload_dir
            .join(format!("{}-{}", uuid::Uuid::new_v4().simple(), filename));
        tokio::fs::write(&staged, &content).await?;
        let staged = scopeguard::guard(staged, |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove staged upload");
            }
        });

        let source = staged.clone();
        let manifest = tokio::task::spawn_blocking(move || archive::read_manifest(&source))
            .await
            .map_err(|e| ExtensionError::Load(format!("manifest task failed: {}", e)))??;

        // A healthy extension keeps its stored archive; only failed ones are replaced
        if let Some(existing) = self.manager.registry().get(&manifest.id).await {
            if existing.state != ExtensionState::Error {
                return Err(ExtensionError::AlreadyRegistered(manifest.id));
            }
        }

        // Staged under a throwaway key until the load succeeds
        let staging_key = format!(
            "{}/{}/.staging-{}-{}",
            ARCHIVE_PREFIX,
            manifest.id,
            uuid::Uuid::new_v4().simple(),
            filename
        );
        self.objects.put(&staging_key, content.clone()).await?;

        let loaded = self.manager.load_plugin(staged.as_path()).await;
        if let Err(del) = self.objects.delete(&staging_key).await {
            tracing::warn!(key = %staging_key, error = %del, "Failed to remove staged archive");
        }
        if let Err(e) = loaded {
            let err = classify_load_error(e);
            tracing::warn!(extension_id = %manifest.id, error = %err, "Uploaded extension failed to load");
            return Err(err);
        }

        let key = format!("{}/{}/{}", ARCHIVE_PREFIX, manifest.id, filename);
        if let Err(e) = self.objects.put(&key, content).await {
            tracing::warn!(extension_id = %manifest.id, key = %key, error = %e, "Failed to persist archive, unloading");
            if let Err(unload) = self.manager.unload_plugin(&manifest.id).await {
                tracing::warn!(extension_id = %manifest.id, error = %unload, "Failed to unload extension");
            }
            return Err(e);
        }

        tracing::info!(extension_id = %manifest.id, filename = %filename, "Extension uploaded");
        Ok(UploadReceipt {
            plugin_id: manifest.id,
            filename: filename.to_string(),
            message: "plugin uploaded and loaded".to_string(),
        })
    }

    async fn list_plugins(&self) -> Result<Vec<PluginSummary>> {
        Ok(self
            .manager
            .list_plugins()
            .await
            .iter()
            .map(PluginSummary::from)
            .collect())
    }

    async fn get_models(&self, plugin_id: &str, api_key: Option<&str>) -> Result<ModelCatalog> {
        let entry = self.entry(plugin_id).await?;
        let api_key = api_key.filter(|k| !k.trim().is_empty());

        let mut catalog = ModelCatalog::new();
        for capability in [CapabilityType::Embedding, CapabilityType::Rerank, CapabilityType::Chat] {
            if !entry.manifest.has_capability(capability) {
                continue;
            }
            let live = match api_key {
                Some(key) => Self::live_models(&entry, capability, key).await,
                None => None,
            };
            let models = live.unwrap_or_else(|| entry.manifest.models(capability).to_vec());
            catalog.insert(capability.to_string(), models);
        }
        Ok(catalog)
    }

    async fn enable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.manager.enable_plugin(plugin_id).await
    }

    async fn disable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.manager.disable_plugin(plugin_id).await
    }

    async fn delete_plugin(&self, plugin_id: &str) -> Result<()> {
        self.manager.unload_plugin(plugin_id).await?;

        let prefix = format!("{}/{}/", ARCHIVE_PREFIX, plugin_id);
        for key in self.objects.list(&prefix).await? {
            if let Err(e) = self.objects.delete(&key).await {
                tracing::warn!(key = %key, error = %e, "Failed to delete stored archive");
            }
        }
        tracing::info!(extension_id = %plugin_id, "Extension deleted");
        Ok(())
    }

    async fn embed(&self, plugin_id: &str, text: &str) -> Result<Embedding> {
        let embedder = self.manager.get_embedder(plugin_id).await?;
        Ok(embedder.embed(text).await?.into())
    }

    async fn embed_batch(&self, plugin_id: &str, texts: &[String]) -> Result<Vec<Embedding>> {
        let embedder = self.manager.get_embedder(plugin_id).await?;
        Ok(embedder
            .embed_batch(texts)
            .await?
            .into_iter()
            .map(Embedding::from)
            .collect())
    }

    async fn rerank(
        &self,
        plugin_id: &str,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RerankResult>> {
        let reranker = self.manager.get_reranker(plugin_id).await?;
        reranker.rerank(query, documents).await
    }

    async fn get_plugin_config(&self, plugin_id: &str) -> Result<PluginConfigView> {
        let entry = self.entry(plugin_id).await?;
        Ok(PluginConfigView {
            plugin_id: plugin_id.to_string(),
            enabled: entry.config.enabled,
            settings: mask_settings(&entry.config.settings),
        })
    }

    async fn update_plugin_config(&self, plugin_id: &str, settings: Map<String, Value>) -> Result<()> {
        let entry = self.entry(plugin_id).await?;
        let mut config = entry.config.clone();
        config.settings.extend(settings);
        self.manager.reload_config(plugin_id, config).await
    }
}
