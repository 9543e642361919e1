//! Per-extension settings: persistence, environment overrides, schema checks.
//!
//! Resolution order, lowest first:
//!
//! ```text
//! schema defaults  <  persisted file  <  PLUGIN_<ID>_<KEY> environment
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::{ExtensionError, Result};
use crate::extension::ExtensionConfig;
use crate::manifest::{ConfigSchema, Manifest};
use crate::store::{FileSettingsStore, SettingsStore};

/// Where environment overrides are read from.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    /// The process environment
    #[default]
    Process,
    /// A fixed set of variables
    Fixed(BTreeMap<String, String>),
}

impl EnvSource {
    fn vars(&self) -> Vec<(String, String)> {
        match self {
            EnvSource::Process => std::env::vars().collect(),
            EnvSource::Fixed(vars) => vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

/// `PLUGIN_` + id uppercased with `-` and `.` turned into `_` + `_`.
pub fn env_prefix(id: &str) -> String {
    let mangled: String = id
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("PLUGIN_{}_", mangled)
}

/// Settings key carried by an environment variable, if it targets `id`.
pub fn env_key(id: &str, var: &str) -> Option<String> {
    let suffix = var.strip_prefix(&env_prefix(id))?;
    if suffix.is_empty() {
        None
    } else {
        Some(suffix.to_ascii_lowercase())
    }
}

/// Copy of `settings` safe to show to callers.
///
/// An `api_key` longer than 8 characters keeps its first and last four,
/// anything shorter is blanked.
pub fn mask_settings(settings: &Map<String, Value>) -> Map<String, Value> {
    let mut masked = settings.clone();
    if let Some(value) = masked.get_mut("api_key") {
        let shown = match value.as_str() {
            Some(key) if key.chars().count() > 8 => {
                let chars: Vec<char> = key.chars().collect();
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("{}****{}", head, tail)
            }
            _ => String::new(),
        };
        *value = Value::String(shown);
    }
    masked
}

/// Check `settings` against a schema: required keys present, declared types respected.
pub fn validate_settings(schema: &ConfigSchema, settings: &Map<String, Value>) -> Result<()> {
    for field in &schema.required {
        match settings.get(field) {
            None | Some(Value::Null) => {
                return Err(ExtensionError::Schema {
                    field: field.clone(),
                    message: "is required".to_string(),
                })
            }
            Some(_) => {}
        }
    }

    for (field, property) in &schema.properties {
        let (Some(value), Some(expected)) = (settings.get(field), property.value_type.as_deref()) else {
            continue;
        };
        let matches = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "object" => value.is_object(),
            "array" => value.is_array(),
            _ => true,
        };
        if !matches {
            return Err(ExtensionError::Schema {
                field: field.clone(),
                message: format!("must be of type {}", expected),
            });
        }
    }
    Ok(())
}

fn coerce(raw: &str, value_type: Option<&str>) -> Value {
    let parsed = match value_type {
        Some("integer") => raw.trim().parse::<i64>().ok().map(Value::from),
        Some("number") => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        Some("boolean") => raw.trim().to_ascii_lowercase().parse::<bool>().ok().map(Value::Bool),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(raw.to_string()))
}

// ============================================================================
// Manager
// ============================================================================

/// Loads, caches and persists extension configs.
pub struct ConfigManager {
    store: Arc<dyn SettingsStore>,
    env: EnvSource,
    cache: RwLock<HashMap<String, ExtensionConfig>>,
}

impl ConfigManager {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            env: EnvSource::Process,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Configs stored as JSON files in `dir`.
    pub fn file_backed(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileSettingsStore::new(dir)))
    }

    pub fn with_env(mut self, env: EnvSource) -> Self {
        self.env = env;
        self
    }

    /// Environment overrides for `id`: variable name, settings key, raw value.
    fn env_overrides(&self, id: &str) -> Vec<(String, String, String)> {
        self.env
            .vars()
            .into_iter()
            .filter_map(|(var, value)| env_key(id, &var).map(|key| (var, key, value)))
            .collect()
    }

    fn apply_env(&self, config: &mut ExtensionConfig) {
        for (var, key, value) in self.env_overrides(&config.extension_id) {
            config.settings.insert(key, Value::String(value.clone()));
            config.environment.insert(var, value);
        }
    }

    /// Cached config, else the persisted one, else one built from the environment.
    pub async fn load_config(&self, id: &str) -> Result<ExtensionConfig> {
        if let Some(config) = self.cache.read().get(id) {
            return Ok(config.clone());
        }

        let mut config = match self.store.read(id).await? {
            Some(mut stored) => {
                stored.extension_id = id.to_string();
                stored.environment.clear();
                stored
            }
            None => {
                tracing::debug!(extension_id = %id, "No stored config, using environment");
                ExtensionConfig::new(id)
            }
        };
        self.apply_env(&mut config);

        self.cache.write().insert(id.to_string(), config.clone());
        Ok(config)
    }

    /// Loaded config completed with schema defaults, environment values typed.
    pub async fn resolve(&self, manifest: &Manifest) -> Result<ExtensionConfig> {
        let mut config = self.load_config(&manifest.id).await?;
        let properties = &manifest.config_schema.properties;

        for var in config.environment.keys() {
            let Some(key) = env_key(&manifest.id, var) else {
                continue;
            };
            let declared = properties.get(&key).and_then(|p| p.value_type.as_deref());
            if let Some(Value::String(raw)) = config.settings.get(&key) {
                let typed = coerce(raw, declared);
                config.settings.insert(key, typed);
            }
        }

        for (key, property) in properties {
            if let Some(default) = &property.default {
                if !config.settings.contains_key(key) {
                    config.settings.insert(key.clone(), default.clone());
                }
            }
        }
        Ok(config)
    }

    pub fn validate_config(&self, manifest: &Manifest, config: &ExtensionConfig) -> Result<()> {
        validate_settings(&manifest.config_schema, &config.settings)
    }

    /// Persist `config` and make it the cached value.
    ///
    /// Settings that came from the environment are not written to the store.
    pub async fn save_config(&self, config: &ExtensionConfig) -> Result<()> {
        self.store.write(&self.persistable(config)).await?;
        self.cache
            .write()
            .insert(config.extension_id.clone(), config.clone());
        tracing::debug!(extension_id = %config.extension_id, "Config saved");
        Ok(())
    }

    fn persistable(&self, config: &ExtensionConfig) -> ExtensionConfig {
        let mut stored = config.clone();
        for var in config.environment.keys() {
            if let Some(key) = env_key(&config.extension_id, var) {
                stored.settings.remove(&key);
            }
        }
        stored.environment.clear();
        stored
    }

    pub fn invalidate(&self, id: &str) {
        self.cache.write().remove(id);
    }

    pub async fn delete_config(&self, id: &str) -> Result<()> {
        self.invalidate(id);
        self.store.delete(id).await
    }
}
