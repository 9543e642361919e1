//! Extension registry and the lifecycle state machine.
//!
//! The registry only keeps books. It never calls into an extension, so its
//! lock is held for map updates alone and callers get snapshot entries that
//! share the instance through an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ExtensionError, Result};
use crate::extension::{supported_capabilities, Extension, ExtensionConfig};
use crate::manifest::{CapabilitySet, CapabilityType, Manifest};

// ============================================================================
// Lifecycle state
// ============================================================================

/// Lifecycle state of a registered extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionState {
    #[default]
    Unloaded,
    Loading,
    Initializing,
    Ready,
    Active,
    Disabled,
    Error,
    Unloading,
}

impl ExtensionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Unloading => "unloading",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: ExtensionState) -> bool {
        use ExtensionState::*;
        if self == next || next == Unloading {
            return true;
        }
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Error, Loading)
                | (Loading, Initializing)
                | (Loading, Error)
                | (Initializing, Ready)
                | (Initializing, Active)
                | (Initializing, Error)
                | (Ready, Active)
                | (Ready, Error)
                | (Active, Disabled)
                | (Active, Error)
                | (Disabled, Active)
                | (Disabled, Error)
        )
    }

    /// Ready or active: the instance may be handed to callers.
    pub fn is_available(self) -> bool {
        matches!(self, Self::Ready | Self::Active)
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Snapshot of one registered extension.
#[derive(Clone)]
pub struct RegistryEntry {
    pub instance: Arc<dyn Extension>,
    pub manifest: Arc<Manifest>,
    pub capabilities: CapabilitySet,
    pub state: ExtensionState,
    pub config: ExtensionConfig,
    /// Message of the failure that put the entry into `error`
    pub error: Option<String>,
    pub loaded_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl RegistryEntry {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("id", &self.manifest.id)
            .field("version", &self.manifest.version)
            .field("capabilities", &self.capabilities)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("loaded_at", &self.loaded_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

#[derive(Default)]
struct Books {
    entries: HashMap<String, RegistryEntry>,
    /// Registration order
    order: Vec<String>,
    by_type: HashMap<CapabilityType, Vec<String>>,
    by_provider: HashMap<String, Vec<String>>,
}

impl Books {
    fn collect(&self, ids: Option<&Vec<String>>) -> Vec<RegistryEntry> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.entries.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

fn remove_id(ids: &mut Vec<String>, id: &str) {
    ids.retain(|existing| existing != id);
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of loaded extensions, indexed by capability type and provider.
pub struct ExtensionRegistry {
    books: RwLock<Books>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(Books::default()),
        }
    }

    /// Add an extension in state `unloaded` with a default config.
    ///
    /// The instance must report the manifest id and implement every
    /// embedding, rerank and chat capability the manifest declares.
    pub async fn register(&self, instance: Arc<dyn Extension>, manifest: Arc<Manifest>) -> Result<()> {
        let id = manifest.id.clone();
        let instance_id = instance.metadata().id.clone();
        if instance_id != id {
            return Err(ExtensionError::Mismatch {
                manifest: id,
                instance: instance_id,
            });
        }

        let capabilities = manifest.capability_set();
        let implemented = supported_capabilities(instance.as_ref());
        for capability in [CapabilityType::Embedding, CapabilityType::Rerank, CapabilityType::Chat] {
            if capabilities.contains(capability) && !implemented.contains(capability) {
                return Err(ExtensionError::CapabilityMismatch {
                    id,
                    capability: capability.to_string(),
                });
            }
        }

        let mut books = self.books.write().await;
        if books.entries.contains_key(&id) {
            return Err(ExtensionError::AlreadyRegistered(id));
        }

        for capability in capabilities.iter() {
            books.by_type.entry(capability).or_default().push(id.clone());
        }
        if !manifest.provider.is_empty() {
            books
                .by_provider
                .entry(manifest.provider.clone())
                .or_default()
                .push(id.clone());
        }
        books.order.push(id.clone());
        books.entries.insert(
            id.clone(),
            RegistryEntry {
                instance,
                config: ExtensionConfig::new(id.clone()),
                manifest,
                capabilities,
                state: ExtensionState::Unloaded,
                error: None,
                loaded_at: None,
                last_used_at: None,
            },
        );

        tracing::debug!(extension_id = %id, "Extension registered");
        Ok(())
    }

    /// Remove an entry and every index reference to it.
    pub async fn unregister(&self, id: &str) -> Result<RegistryEntry> {
        let mut books = self.books.write().await;
        let entry = books
            .entries
            .remove(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;

        remove_id(&mut books.order, id);
        books.by_type.retain(|_, ids| {
            remove_id(ids, id);
            !ids.is_empty()
        });
        books.by_provider.retain(|_, ids| {
            remove_id(ids, id);
            !ids.is_empty()
        });

        tracing::debug!(extension_id = %id, "Extension unregistered");
        Ok(entry)
    }

    pub async fn get(&self, id: &str) -> Option<RegistryEntry> {
        self.books.read().await.entries.get(id).cloned()
    }

    /// All entries in registration order.
    pub async fn list(&self) -> Vec<RegistryEntry> {
        let books = self.books.read().await;
        books.collect(Some(&books.order))
    }

    pub async fn get_by_type(&self, capability: CapabilityType) -> Vec<RegistryEntry> {
        let books = self.books.read().await;
        books.collect(books.by_type.get(&capability))
    }

    pub async fn get_by_provider(&self, provider: &str) -> Vec<RegistryEntry> {
        let books = self.books.read().await;
        books.collect(books.by_provider.get(provider))
    }

    /// Move an entry to `state`, recording `error` when given.
    ///
    /// Illegal transitions fail and leave the entry untouched.
    pub async fn update_state(&self, id: &str, state: ExtensionState, error: Option<String>) -> Result<()> {
        let mut books = self.books.write().await;
        let entry = books
            .entries
            .get_mut(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;

        if !entry.state.can_transition_to(state) {
            return Err(ExtensionError::Lifecycle {
                id: id.to_string(),
                operation: "transition",
                message: format!("illegal state transition {} -> {}", entry.state, state),
            });
        }

        tracing::debug!(extension_id = %id, from = %entry.state, to = %state, "State transition");
        entry.state = state;
        entry.error = match error {
            Some(message) => Some(message),
            None if state == ExtensionState::Error => entry.error.take(),
            None => None,
        };
        Ok(())
    }

    pub async fn update_config(&self, id: &str, config: ExtensionConfig) -> Result<()> {
        let mut books = self.books.write().await;
        let entry = books
            .entries
            .get_mut(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
        entry.config = config;
        Ok(())
    }

    /// Record a use of the extension.
    pub async fn touch(&self, id: &str) {
        if let Some(entry) = self.books.write().await.entries.get_mut(id) {
            entry.last_used_at = Some(chrono::Utc::now());
        }
    }

    pub async fn mark_loaded(&self, id: &str) {
        if let Some(entry) = self.books.write().await.entries.get_mut(id) {
            entry.loaded_at = Some(chrono::Utc::now());
        }
    }

    pub async fn count(&self) -> usize {
        self.books.read().await.entries.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.books.read().await.entries.contains_key(id)
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
