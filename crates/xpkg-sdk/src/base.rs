//! Shared state most extensions need: manifest, current config, lifecycle flags.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use xpkg_core::{ExtensionConfig, ExtensionError, Manifest, Result};

/// Base lifecycle for capability extensions to compose.
///
/// `initialize` stores the config and marks the extension ready, `enable` and
/// `disable` toggle a flag, `cleanup` resets everything.
pub struct ExtensionCore {
    manifest: Manifest,
    config: RwLock<Option<ExtensionConfig>>,
    ready: AtomicBool,
    enabled: AtomicBool,
}

impl ExtensionCore {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            config: RwLock::new(None),
            ready: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
        }
    }

    /// Parse and validate an embedded `manifest.json`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(Manifest::from_slice(json.as_bytes())?))
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn initialize(&self, config: &ExtensionConfig) -> Result<()> {
        *self.config.write() = Some(config.clone());
        self.ready.store(true, Ordering::SeqCst);
        tracing::debug!(extension_id = %self.manifest.id, "Extension core initialized");
        Ok(())
    }

    pub fn enable(&self) -> Result<()> {
        self.ensure_ready()?;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        self.ensure_ready()?;
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn reload(&self, config: &ExtensionConfig) -> Result<()> {
        self.ensure_ready()?;
        *self.config.write() = Some(config.clone());
        Ok(())
    }

    pub fn cleanup(&self) -> Result<()> {
        *self.config.write() = None;
        self.ready.store(false, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Fail unless initialized and enabled. Call at the top of capability methods.
    pub fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(ExtensionError::InvalidState {
                id: self.manifest.id.clone(),
                state: if self.is_ready() { "disabled" } else { "unloaded" }.to_string(),
            })
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ExtensionError::InvalidState {
                id: self.manifest.id.clone(),
                state: "unloaded".to_string(),
            })
        }
    }

    pub fn config(&self) -> Option<ExtensionConfig> {
        self.config.read().clone()
    }

    pub fn setting(&self, key: &str) -> Option<Value> {
        self.config
            .read()
            .as_ref()
            .and_then(|c| c.settings.get(key).cloned())
    }

    pub fn setting_str(&self, key: &str) -> Option<String> {
        match self.setting(key)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Integer setting; numeric strings (from the environment) are accepted.
    pub fn setting_i64(&self, key: &str) -> Option<i64> {
        match self.setting(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn setting_f64(&self, key: &str) -> Option<f64> {
        match self.setting(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        match self.setting(key)? {
            Value::Bool(b) => Some(b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Non-empty string setting or a schema error naming `key`.
    pub fn require_str(&self, key: &str) -> Result<String> {
        self.setting_str(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExtensionError::Schema {
                field: key.to_string(),
                message: "is required".to_string(),
            })
    }
}
