//! Narrow interfaces to the collaborators the runtime persists into.
//!
//! - [`SettingsStore`]: one JSON config document per extension id
//! - [`ObjectStore`]: durable bytes addressed by `/`-separated keys

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::archive::sanitize_entry_name;
use crate::error::{ExtensionError, Result};
use crate::extension::ExtensionConfig;

// ============================================================================
// Settings
// ============================================================================

#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    /// `None` when nothing was saved for `id`.
    async fn read(&self, id: &str) -> Result<Option<ExtensionConfig>>;

    async fn write(&self, config: &ExtensionConfig) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Stores `<dir>/<id>.json`, pretty printed.
pub struct FileSettingsStore {
    dir: PathBuf,
}

impl FileSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(ExtensionError::Validation(format!("invalid extension id: {}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait::async_trait]
impl SettingsStore for FileSettingsStore {
    async fn read(&self, id: &str) -> Result<Option<ExtensionConfig>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, config: &ExtensionConfig) -> Result<()> {
        let path = self.path_for(&config.extension_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory settings, for tests and embedded use.
#[derive(Default)]
pub struct MemorySettingsStore {
    configs: RwLock<HashMap<String, ExtensionConfig>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn read(&self, id: &str) -> Result<Option<ExtensionConfig>> {
        Ok(self.configs.read().get(id).cloned())
    }

    async fn write(&self, config: &ExtensionConfig) -> Result<()> {
        self.configs
            .write()
            .insert(config.extension_id.clone(), config.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.configs.write().remove(id);
        Ok(())
    }
}

// ============================================================================
// Objects
// ============================================================================

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Objects as files below a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        sanitize_entry_name(key)
            .map(|relative| self.root.join(relative))
            .ok_or_else(|| ExtensionError::Validation(format!("invalid object key: {}", key)))
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ExtensionError::NotFound(format!("object {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ExtensionError::NotFound(format!("object {}", key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(dir.path().join("config"));
        assert!(store.read("demo").await.unwrap().is_none());

        let config = ExtensionConfig::disabled("demo").with_setting("api_key", "sk");
        store.write(&config).await.unwrap();
        assert!(dir.path().join("config/demo.json").is_file());
        assert_eq!(store.read("demo").await.unwrap(), Some(config));

        store.delete("demo").await.unwrap();
        store.delete("demo").await.unwrap();
        assert!(store.read("demo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_settings_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(dir.path());
        assert!(store.read("../etc").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_objects_list_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("plugins/demo/demo.xpkg", b"a".to_vec()).await.unwrap();
        store.put("plugins/demo/old.xpkg", b"b".to_vec()).await.unwrap();
        store.put("plugins/other/other.xpkg", b"c".to_vec()).await.unwrap();

        let keys = store.list("plugins/demo/").await.unwrap();
        assert_eq!(keys, vec!["plugins/demo/demo.xpkg", "plugins/demo/old.xpkg"]);
        assert_eq!(store.get("plugins/demo/old.xpkg").await.unwrap(), b"b");

        store.delete("plugins/demo/old.xpkg").await.unwrap();
        assert!(matches!(
            store.get("plugins/demo/old.xpkg").await,
            Err(ExtensionError::NotFound(_))
        ));
        assert!(store.put("../escape", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_objects() {
        let store = MemoryObjectStore::new();
        store.put("plugins/a/x.xpkg", vec![1]).await.unwrap();
        store.put("plugins/b/y.xpkg", vec![2]).await.unwrap();
        assert_eq!(store.list("plugins/a/").await.unwrap().len(), 1);
        store.delete("plugins/a/x.xpkg").await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
