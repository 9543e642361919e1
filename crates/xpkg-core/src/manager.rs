//! Extension manager: drives loading and the lifecycle of every extension.
//!
//! ```text
//! load_plugin(path)
//!   ├─ ExtensionLoader::load_extension   archive -> instance
//!   ├─ register                          state = unloaded
//!   ├─ begin_load                        unloaded -> loading
//!   ├─ ConfigManager::resolve            defaults < file < environment
//!   └─ initialize                        loading -> initializing -> ready | active | error
//! ```
//!
//! Extension code is always called outside the registry lock; state changes
//! are recorded before and after each call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive;
use crate::config::ConfigManager;
use crate::error::{ExtensionError, Result};
use crate::extension::{ChatHandle, EmbedderHandle, Extension, ExtensionConfig, RerankerHandle};
use crate::loader::{runtime_version, ExtensionHost, ExtensionLoader, LoadedExtension};
use crate::manifest::CapabilityType;
use crate::registry::{ExtensionRegistry, ExtensionState, RegistryEntry};

// ============================================================================
// Configuration
// ============================================================================

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory scanned for `.xpkg` archives
    pub plugin_dir: PathBuf,
    /// Root for extraction sandboxes and library copies
    pub temp_dir: PathBuf,
    /// Persisted `<id>.json` configs
    pub config_dir: PathBuf,
    /// List archives in `plugin_dir` on start
    pub auto_discover: bool,
    /// Load discovered archives on start
    pub auto_load: bool,
    pub host_version: semver::Version,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("./internal/plugin_storage"),
            temp_dir: PathBuf::from("./tmp/plugins"),
            config_dir: PathBuf::from("./config/plugins"),
            auto_discover: false,
            auto_load: false,
            host_version: runtime_version(),
        }
    }
}

impl ManagerConfig {
    /// Defaults overridden by `XPKG_PLUGIN_DIR`, `XPKG_TEMP_DIR`,
    /// `XPKG_CONFIG_DIR`, `XPKG_AUTO_DISCOVER` and `XPKG_AUTO_LOAD`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("XPKG_PLUGIN_DIR") {
            config.plugin_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("XPKG_TEMP_DIR") {
            config.temp_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("XPKG_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }
        if let Ok(flag) = std::env::var("XPKG_AUTO_DISCOVER") {
            config.auto_discover = flag_enabled(&flag);
        }
        if let Ok(flag) = std::env::var("XPKG_AUTO_LOAD") {
            config.auto_load = flag_enabled(&flag);
        }
        config
    }

    /// All directories below one root, for tests and embedded use.
    pub fn rooted(root: &Path) -> Self {
        Self {
            plugin_dir: root.join("plugins"),
            temp_dir: root.join("tmp"),
            config_dir: root.join("config"),
            ..Default::default()
        }
    }
}

fn flag_enabled(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

// ============================================================================
// Manager
// ============================================================================

pub struct ExtensionManager {
    config: ManagerConfig,
    configs: Arc<ConfigManager>,
    registry: Arc<ExtensionRegistry>,
    loader: ExtensionLoader,
}

impl ExtensionManager {
    /// Manager with file-backed configs under `config.config_dir`.
    pub fn new(config: ManagerConfig, host: Arc<dyn ExtensionHost>) -> Result<Self> {
        let configs = ConfigManager::file_backed(&config.config_dir);
        Self::with_config_manager(config, host, configs)
    }

    pub fn with_config_manager(
        config: ManagerConfig,
        host: Arc<dyn ExtensionHost>,
        configs: ConfigManager,
    ) -> Result<Self> {
        for dir in [&config.plugin_dir, &config.temp_dir, &config.config_dir] {
            std::fs::create_dir_all(dir)?;
        }

        let configs = Arc::new(configs);
        let registry = Arc::new(ExtensionRegistry::new());
        let loader = ExtensionLoader::new(&config.temp_dir, host)
            .with_host_version(config.host_version.clone());

        tracing::info!(
            plugin_dir = %config.plugin_dir.display(),
            host = loader.host().kind(),
            "Extension manager created"
        );

        Ok(Self {
            config,
            configs,
            registry,
            loader,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.configs
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// Run startup discovery. Call once, before serving traffic.
    pub async fn start(&self) -> Result<()> {
        if !self.config.auto_discover {
            return Ok(());
        }
        let found: Vec<PathBuf> = archive::discover(&self.config.plugin_dir).collect();
        tracing::info!(
            count = found.len(),
            dir = %self.config.plugin_dir.display(),
            "Discovered extension archives"
        );
        if self.config.auto_load {
            self.load_all(found).await;
        }
        Ok(())
    }

    /// Unload everything, in registration order.
    pub async fn shutdown(&self) {
        for entry in self.registry.list().await {
            if let Err(e) = self.unload_plugin(entry.id()).await {
                tracing::warn!(extension_id = %entry.id(), error = %e, "Failed to unload extension");
            }
        }
        tracing::info!("Extension manager shut down");
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load an archive without registering it.
    pub async fn load_extension(&self, path: &Path) -> Result<LoadedExtension> {
        self.loader.load_extension(path).await
    }

    pub async fn register(&self, loaded: LoadedExtension) -> Result<()> {
        let id = loaded.manifest.id.clone();
        self.registry.register(loaded.instance, loaded.manifest).await?;
        self.registry.mark_loaded(&id).await;
        Ok(())
    }

    pub async fn begin_load(&self, id: &str) -> Result<()> {
        self.registry
            .update_state(id, ExtensionState::Loading, None)
            .await
    }

    /// Validate `config`, run `initialize` and, when enabled, `enable`.
    ///
    /// Ends in `ready` (disabled config), `active`, or `error` with the
    /// failure message kept on the entry.
    pub async fn initialize(&self, id: &str, config: ExtensionConfig) -> Result<()> {
        let entry = self.entry(id).await?;
        self.registry
            .update_state(id, ExtensionState::Initializing, None)
            .await?;

        let checked = self
            .configs
            .validate_config(&entry.manifest, &config)
            .and_then(|_| entry.instance.validate_config(&config));
        if let Err(e) = checked {
            return Err(self.fail(id, e).await);
        }

        if let Err(e) = entry.instance.initialize(&config).await {
            return Err(self.fail(id, ExtensionError::lifecycle(id, "initialize", e)).await);
        }
        self.registry.update_config(id, config.clone()).await?;

        if !config.enabled {
            self.registry
                .update_state(id, ExtensionState::Ready, None)
                .await?;
            tracing::info!(extension_id = %id, "Extension initialized (disabled)");
            return Ok(());
        }

        if let Err(e) = entry.instance.enable().await {
            return Err(self.fail(id, ExtensionError::lifecycle(id, "enable", e)).await);
        }
        self.registry
            .update_state(id, ExtensionState::Active, None)
            .await?;
        tracing::info!(extension_id = %id, "Extension initialized and active");
        Ok(())
    }

    /// Full pipeline: load, register, resolve config, initialize.
    ///
    /// An entry left in `error` by an earlier attempt is replaced.
    pub async fn load_plugin(&self, path: &Path) -> Result<String> {
        let loaded = self.load_extension(path).await?;
        let id = loaded.manifest.id.clone();

        if let Some(existing) = self.registry.get(&id).await {
            if existing.state != ExtensionState::Error {
                if let Err(e) = loaded.instance.cleanup().await {
                    tracing::debug!(extension_id = %id, error = %e, "Cleanup of duplicate instance failed");
                }
                return Err(ExtensionError::AlreadyRegistered(id));
            }
            tracing::info!(extension_id = %id, "Replacing extension left in error state");
            self.unload_plugin(&id).await?;
        }

        let manifest = loaded.manifest.clone();
        let instance = loaded.instance.clone();
        if let Err(e) = self.register(loaded).await {
            if let Err(cleanup) = instance.cleanup().await {
                tracing::debug!(extension_id = %id, error = %cleanup, "Cleanup of rejected instance failed");
            }
            return Err(e);
        }
        self.begin_load(&id).await?;

        let config = match self.configs.resolve(&manifest).await {
            Ok(config) => config,
            Err(e) => return Err(self.fail(&id, e).await),
        };
        self.initialize(&id, config).await?;
        Ok(id)
    }

    /// Load every archive in the plugin directory. Failures are logged and skipped.
    pub async fn discover_and_load(&self) -> Vec<String> {
        let found: Vec<PathBuf> = archive::discover(&self.config.plugin_dir).collect();
        self.load_all(found).await
    }

    async fn load_all(&self, paths: Vec<PathBuf>) -> Vec<String> {
        let mut loaded = Vec::new();
        for path in paths {
            match self.load_plugin(&path).await {
                Ok(id) => loaded.push(id),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to load extension archive");
                }
            }
        }
        loaded
    }

    /// Move to `unloading`, run `cleanup` (failures logged), drop the entry.
    pub async fn unload_plugin(&self, id: &str) -> Result<()> {
        let entry = self.entry(id).await?;
        self.registry
            .update_state(id, ExtensionState::Unloading, None)
            .await?;

        if let Err(e) = entry.instance.cleanup().await {
            tracing::warn!(extension_id = %id, error = %e, "Extension cleanup failed");
        }

        self.registry.unregister(id).await?;
        self.configs.invalidate(id);
        tracing::info!(extension_id = %id, "Extension unloaded");
        Ok(())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    async fn entry(&self, id: &str) -> Result<RegistryEntry> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| ExtensionError::NotFound(format!("extension {}", id)))
    }

    /// Instance of a ready or active extension.
    pub async fn get_plugin(&self, id: &str) -> Result<Arc<dyn Extension>> {
        let entry = self.entry(id).await?;
        if !entry.state.is_available() {
            return Err(ExtensionError::InvalidState {
                id: id.to_string(),
                state: entry.state.to_string(),
            });
        }
        Ok(entry.instance)
    }

    pub async fn get_embedder(&self, id: &str) -> Result<EmbedderHandle> {
        let handle = EmbedderHandle::new(self.get_plugin(id).await?)?;
        self.registry.touch(id).await;
        Ok(handle)
    }

    pub async fn get_reranker(&self, id: &str) -> Result<RerankerHandle> {
        let handle = RerankerHandle::new(self.get_plugin(id).await?)?;
        self.registry.touch(id).await;
        Ok(handle)
    }

    pub async fn get_chat(&self, id: &str) -> Result<ChatHandle> {
        let handle = ChatHandle::new(self.get_plugin(id).await?)?;
        self.registry.touch(id).await;
        Ok(handle)
    }

    /// First active extension of `capability` serving `model` (any model when `None`).
    pub async fn find_by_capability(
        &self,
        capability: CapabilityType,
        model: Option<&str>,
    ) -> Result<RegistryEntry> {
        let found = self
            .registry
            .get_by_type(capability)
            .await
            .into_iter()
            .filter(|entry| entry.state == ExtensionState::Active)
            .find(|entry| model.map_or(true, |m| entry.manifest.supports_model(capability, m)));

        match found {
            Some(entry) => {
                self.registry.touch(entry.id()).await;
                Ok(entry)
            }
            None => Err(ExtensionError::NotFound(match model {
                Some(model) => format!("active {} extension for model {}", capability, model),
                None => format!("active {} extension", capability),
            })),
        }
    }

    pub async fn list_plugins(&self) -> Vec<RegistryEntry> {
        self.registry.list().await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Record `err` on the entry and hand it back.
    async fn fail(&self, id: &str, err: ExtensionError) -> ExtensionError {
        tracing::warn!(extension_id = %id, error = %err, "Extension entered error state");
        if let Err(e) = self
            .registry
            .update_state(id, ExtensionState::Error, Some(err.to_string()))
            .await
        {
            tracing::warn!(extension_id = %id, error = %e, "Failed to record error state");
        }
        err
    }

    async fn set_enabled(&self, entry: &RegistryEntry, enabled: bool) -> Result<()> {
        let mut config = entry.config.clone();
        config.enabled = enabled;
        self.registry.update_config(entry.id(), config.clone()).await?;
        if let Err(e) = self.configs.save_config(&config).await {
            tracing::warn!(extension_id = %entry.id(), error = %e, "Failed to persist enabled flag");
        }
        Ok(())
    }

    /// Ready or disabled -> active. Already active is a no-op.
    pub async fn enable_plugin(&self, id: &str) -> Result<()> {
        let entry = self.entry(id).await?;
        match entry.state {
            ExtensionState::Active => return Ok(()),
            ExtensionState::Ready | ExtensionState::Disabled => {}
            state => {
                return Err(ExtensionError::InvalidState {
                    id: id.to_string(),
                    state: state.to_string(),
                })
            }
        }

        if let Err(e) = entry.instance.enable().await {
            return Err(self.fail(id, ExtensionError::lifecycle(id, "enable", e)).await);
        }
        self.registry
            .update_state(id, ExtensionState::Active, None)
            .await?;
        self.set_enabled(&entry, true).await?;
        tracing::info!(extension_id = %id, "Extension enabled");
        Ok(())
    }

    /// Active -> disabled. Already disabled is a no-op.
    pub async fn disable_plugin(&self, id: &str) -> Result<()> {
        let entry = self.entry(id).await?;
        match entry.state {
            ExtensionState::Disabled => return Ok(()),
            ExtensionState::Active => {}
            state => {
                return Err(ExtensionError::InvalidState {
                    id: id.to_string(),
                    state: state.to_string(),
                })
            }
        }

        if let Err(e) = entry.instance.disable().await {
            return Err(self.fail(id, ExtensionError::lifecycle(id, "disable", e)).await);
        }
        self.registry
            .update_state(id, ExtensionState::Disabled, None)
            .await?;
        self.set_enabled(&entry, false).await?;
        tracing::info!(extension_id = %id, "Extension disabled");
        Ok(())
    }

    /// Apply a new config to a running extension and persist it.
    ///
    /// A config failing validation changes nothing. When the extension
    /// rejects it the entry goes to `error` and keeps its previous config.
    pub async fn reload_config(&self, id: &str, config: ExtensionConfig) -> Result<()> {
        let entry = self.entry(id).await?;
        self.configs.validate_config(&entry.manifest, &config)?;
        entry.instance.validate_config(&config)?;

        if let Err(e) = entry.instance.reload_config(&config).await {
            return Err(self.fail(id, ExtensionError::lifecycle(id, "reload config", e)).await);
        }

        self.registry.update_config(id, config.clone()).await?;
        self.configs.save_config(&config).await?;
        tracing::info!(extension_id = %id, "Extension config reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directories() {
        let config = ManagerConfig::default();
        assert_eq!(config.plugin_dir, PathBuf::from("./internal/plugin_storage"));
        assert_eq!(config.temp_dir, PathBuf::from("./tmp/plugins"));
        assert_eq!(config.config_dir, PathBuf::from("./config/plugins"));
        assert!(!config.auto_discover);
        assert!(!config.auto_load);
    }

    #[test]
    fn test_flag_parsing() {
        assert!(flag_enabled("true"));
        assert!(flag_enabled(" 1 "));
        assert!(flag_enabled("ON"));
        assert!(!flag_enabled("false"));
        assert!(!flag_enabled(""));
    }
}
