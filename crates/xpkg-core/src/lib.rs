//! Extension runtime for xpkg.
//!
//! Packages provider-specific capability modules (embedding, rerank, chat)
//! as `.xpkg` archives, loads them at runtime and drives their lifecycle.
//!
//! ```text
//! archive / manifest ─► loader ─► registry ─► manager ─► service
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod extension;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod package;
pub mod registry;
pub mod service;
pub mod store;

pub use error::{ExtensionError, Result};
pub use extension::{
    Chat, ChatHandle, ChunkSink, Embedder, EmbedderHandle, Extension, ExtensionConfig,
    RerankDocument, RerankResult, Reranker, RerankerHandle,
};
pub use loader::{ExtensionHost, ExtensionLoader, LoadedExtension, NativeHost, StagedPackage};
pub use manager::{ExtensionManager, ManagerConfig};
pub use manifest::{Capability, CapabilitySet, CapabilityType, ConfigSchema, Manifest};
pub use registry::{ExtensionRegistry, ExtensionState, RegistryEntry};
pub use service::{LocalPluginService, PluginOperations};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{ConfigManager, EnvSource};
    pub use crate::error::{ExtensionError, Result};
    pub use crate::extension::{
        Chat, ChatMessage, ChatRequest, ChatResponse, ChunkSink, Embedder, Extension,
        ExtensionConfig, RerankDocument, RerankResult, Reranker,
    };
    pub use crate::manifest::{Capability, CapabilityType, Manifest};
    pub use crate::registry::ExtensionState;
    pub use crate::service::{
        Embedding, ModelCatalog, PluginConfigView, PluginOperations, PluginSummary, UploadReceipt,
    };
}
