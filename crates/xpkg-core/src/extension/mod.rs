//! Extension instances and their capabilities.
//!
//! ```text
//!                    ┌──────────────────────────┐
//!                    │  Arc<dyn Extension>      │
//!                    │  metadata / lifecycle    │
//!                    └────────────┬─────────────┘
//!            ┌────────────────────┼────────────────────┐
//!            ▼                    ▼                    ▼
//!   ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐
//!   │ EmbedderHandle  │  │ RerankerHandle  │  │   ChatHandle    │
//!   │ as_embedder()   │  │ as_reranker()   │  │   as_chat()     │
//!   └─────────────────┘  └─────────────────┘  └─────────────────┘
//! ```
//!
//! An extension opts into a capability by returning `Some` from the matching
//! `as_*` accessor. The manifest declares the same set; the registry refuses
//! instances whose declaration and implementation disagree.

pub mod capability;
pub mod types;

pub use capability::{normalize_rerank, ChatHandle, EmbedderHandle, RerankerHandle};
pub use types::{
    supported_capabilities, Chat, ChatChoice, ChatMessage, ChatRequest, ChatResponse, ChatUsage,
    ChunkSink, Embedder, Extension, ExtensionConfig, RerankDocument, RerankResult, Reranker,
    STREAM_END_MARKER,
};
