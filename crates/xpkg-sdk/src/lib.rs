//! SDK for building xpkg extensions.
//!
//! An extension is a `cdylib` crate that implements [`Extension`] plus one or
//! more capability traits, then exports itself with [`export_extension!`].
//!
//! ```text
//! manifest.json ─┐
//! plugin.so ─────┼─ xpkg-pack ─► demo.xpkg ─► NativeHost
//! README.md ─────┘
//! ```
//!
//! The host and the extension must be built from the same `xpkg-core`
//! version and compiler, since the constructor hands a Rust trait object
//! across the library boundary.

mod base;
mod macros;

pub use crate::base::ExtensionCore;

pub use async_trait::async_trait;
pub use xpkg_core;
pub use xpkg_core::loader::native::{ExtensionBox, ABI_VERSION};

pub mod prelude {
    pub use crate::base::ExtensionCore;
    pub use crate::export_extension;
    pub use async_trait::async_trait;
    pub use xpkg_core::extension::{
        Chat, ChatChoice, ChatMessage, ChatRequest, ChatResponse, ChatUsage, ChunkSink, Embedder,
        Extension, ExtensionConfig, RerankDocument, RerankResult, Reranker,
    };
    pub use xpkg_core::manifest::{Capability, CapabilityType, Manifest};
    pub use xpkg_core::{ExtensionError, Result};
}
