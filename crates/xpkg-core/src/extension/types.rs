//! Extension trait, capability traits and per-call payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ExtensionError, Result};
use crate::manifest::{CapabilitySet, CapabilityType, Manifest};

// ============================================================================
// Configuration
// ============================================================================

fn default_enabled() -> bool {
    true
}

/// Resolved settings for one extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    #[serde(rename = "plugin_id")]
    pub extension_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Environment variables that contributed to `settings`
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ExtensionConfig {
    /// Enabled config with no settings.
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            enabled: true,
            settings: serde_json::Map::new(),
            environment: BTreeMap::new(),
        }
    }

    pub fn disabled(extension_id: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::new(extension_id)
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.settings.get(key)
    }
}

// ============================================================================
// Capability payloads
// ============================================================================

/// Document submitted for reranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankDocument {
    pub id: u64,
    pub content: String,
    /// Score from the first-stage retriever
    #[serde(default)]
    pub score: f64,
}

impl RerankDocument {
    pub fn new(id: u64, content: impl Into<String>) -> Self {
        Self {
            id,
            content: content.into(),
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub document: RerankDocument,
    pub score: f64,
    /// 1-based position after reranking
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// user, assistant or system
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    /// Provider specific parameters
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra_params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: ChatUsage,
}

/// Marker delivered after the last streamed chat chunk.
pub const STREAM_END_MARKER: &[u8] = b"[DONE]";

/// Receiving side of a streamed chat call, handed to extension code.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Deliver one chunk. Fails with `Cancelled` once the caller stopped listening.
    pub async fn send(&self, chunk: impl Into<Vec<u8>>) -> Result<()> {
        self.tx
            .send(chunk.into())
            .await
            .map_err(|_| ExtensionError::Cancelled("stream receiver dropped".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A loaded extension instance.
///
/// Methods take `&self`: the runtime never serializes calls into an
/// extension, so implementations keep their own interior state thread-safe.
#[async_trait::async_trait]
pub trait Extension: Send + Sync {
    /// Identity compiled into the extension.
    fn metadata(&self) -> &Manifest;

    async fn initialize(&self, config: &ExtensionConfig) -> Result<()>;

    /// Extension-specific settings checks, run after schema validation.
    fn validate_config(&self, _config: &ExtensionConfig) -> Result<()> {
        Ok(())
    }

    fn ready(&self) -> bool;

    async fn enable(&self) -> Result<()>;

    async fn disable(&self) -> Result<()>;

    async fn reload_config(&self, config: &ExtensionConfig) -> Result<()>;

    async fn cleanup(&self) -> Result<()>;

    fn as_embedder(&self) -> Option<&dyn Embedder> {
        None
    }

    fn as_reranker(&self) -> Option<&dyn Reranker> {
        None
    }

    fn as_chat(&self) -> Option<&dyn Chat> {
        None
    }
}

/// Capabilities an instance actually implements.
pub fn supported_capabilities(extension: &dyn Extension) -> CapabilitySet {
    let mut set = CapabilitySet::empty();
    if extension.as_embedder().is_some() {
        set.insert(CapabilityType::Embedding);
    }
    if extension.as_reranker().is_some() {
        set.insert(CapabilityType::Rerank);
    }
    if extension.as_chat().is_some() {
        set.insert(CapabilityType::Chat);
    }
    set
}

/// Text embedding capability.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Fixed length of every returned vector.
    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Live model listing using the caller's provider credentials.
    async fn models(&self, _api_key: &str) -> Result<Vec<String>> {
        Err(ExtensionError::NotImplemented("live embedding model listing".to_string()))
    }
}

/// Document reranking capability.
#[async_trait::async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[RerankDocument]) -> Result<Vec<RerankResult>>;

    async fn models(&self, _api_key: &str) -> Result<Vec<String>> {
        Err(ExtensionError::NotImplemented("live rerank model listing".to_string()))
    }
}

/// Chat completion capability.
#[async_trait::async_trait]
pub trait Chat: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Push incremental output into `sink`. The end marker is appended by the runtime.
    async fn chat_stream(&self, request: &ChatRequest, sink: ChunkSink) -> Result<()>;
}
