//! Typed capability handles over a shared extension core.
//!
//! Each handle keeps an `Arc` to the same instance, so one extension can serve
//! as embedder, reranker and chat backend at once without copying its state.
//! The handles enforce the contracts that individual extensions are not
//! trusted to honour: blank input, vector length, rerank ordering and the
//! stream end marker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::types::{
    Chat, ChatRequest, ChatResponse, ChunkSink, Embedder, Extension, RerankDocument, RerankResult,
    Reranker, STREAM_END_MARKER,
};
use crate::error::{ExtensionError, Result};

async fn within<T>(
    id: &str,
    deadline: Option<Duration>,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            ExtensionError::Cancelled(format!("{} did not answer within {:?}", id, limit))
        })?,
        None => call.await,
    }
}

fn unsupported(id: &str, capability: &str) -> ExtensionError {
    ExtensionError::Unsupported {
        id: id.to_string(),
        capability: capability.to_string(),
    }
}

// ============================================================================
// Embedder
// ============================================================================

#[derive(Clone)]
pub struct EmbedderHandle {
    id: String,
    core: Arc<dyn Extension>,
    deadline: Option<Duration>,
}

impl EmbedderHandle {
    pub fn new(core: Arc<dyn Extension>) -> Result<Self> {
        let id = core.metadata().id.clone();
        if core.as_embedder().is_none() {
            return Err(unsupported(&id, "Embedder"));
        }
        Ok(Self {
            id,
            core,
            deadline: None,
        })
    }

    /// Abandon calls that take longer than `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn inner(&self) -> Result<&dyn Embedder> {
        self.core
            .as_embedder()
            .ok_or_else(|| unsupported(&self.id, "Embedder"))
    }

    fn check_length(&self, vector: &[f32]) -> Result<()> {
        let expected = self.dimensions();
        if expected > 0 && vector.len() != expected {
            return Err(ExtensionError::lifecycle(
                &self.id,
                "embed",
                format!("returned {} dimensions, declared {}", vector.len(), expected),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Embedder for EmbedderHandle {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(ExtensionError::EmptyInput);
        }
        let vector = within(&self.id, self.deadline, self.inner()?.embed(text)).await?;
        self.check_length(&vector)?;
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.core.as_embedder().map(|e| e.dimensions()).unwrap_or(0)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(ExtensionError::EmptyInput);
        }
        let vectors = within(&self.id, self.deadline, self.inner()?.embed_batch(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(ExtensionError::lifecycle(
                &self.id,
                "embed",
                format!("returned {} vectors for {} texts", vectors.len(), texts.len()),
            ));
        }
        for vector in &vectors {
            self.check_length(vector)?;
        }
        Ok(vectors)
    }

    async fn models(&self, api_key: &str) -> Result<Vec<String>> {
        within(&self.id, self.deadline, self.inner()?.models(api_key)).await
    }
}

// ============================================================================
// Reranker
// ============================================================================

#[derive(Clone)]
pub struct RerankerHandle {
    id: String,
    core: Arc<dyn Extension>,
    deadline: Option<Duration>,
}

impl RerankerHandle {
    pub fn new(core: Arc<dyn Extension>) -> Result<Self> {
        let id = core.metadata().id.clone();
        if core.as_reranker().is_none() {
            return Err(unsupported(&id, "Reranker"));
        }
        Ok(Self {
            id,
            core,
            deadline: None,
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait::async_trait]
impl Reranker for RerankerHandle {
    async fn rerank(&self, query: &str, documents: &[RerankDocument]) -> Result<Vec<RerankResult>> {
        if query.trim().is_empty() {
            return Err(ExtensionError::EmptyInput);
        }
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let reranker = self
            .core
            .as_reranker()
            .ok_or_else(|| unsupported(&self.id, "Reranker"))?;
        let results = within(&self.id, self.deadline, reranker.rerank(query, documents)).await?;
        normalize_rerank(&self.id, documents, results)
    }

    async fn models(&self, api_key: &str) -> Result<Vec<String>> {
        let reranker = self
            .core
            .as_reranker()
            .ok_or_else(|| unsupported(&self.id, "Reranker"))?;
        within(&self.id, self.deadline, reranker.models(api_key)).await
    }
}

/// Match results back to the input documents, then order them.
///
/// Every input document must appear exactly once. Output is sorted by
/// descending score, ties keep input order, and ranks run 1..=N.
pub fn normalize_rerank(
    id: &str,
    documents: &[RerankDocument],
    results: Vec<RerankResult>,
) -> Result<Vec<RerankResult>> {
    if results.len() != documents.len() {
        return Err(ExtensionError::lifecycle(
            id,
            "rerank",
            format!("returned {} results for {} documents", results.len(), documents.len()),
        ));
    }

    let mut used = vec![false; documents.len()];
    let mut scored = Vec::with_capacity(results.len());
    for result in results {
        let position = documents.iter().enumerate().position(|(i, doc)| {
            !used[i] && doc.id == result.document.id && doc.content == result.document.content
        });
        let Some(position) = position else {
            return Err(ExtensionError::lifecycle(
                id,
                "rerank",
                format!("returned unknown or repeated document {}", result.document.id),
            ));
        };
        used[position] = true;
        scored.push((position, result.score));
    }

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    Ok(scored
        .into_iter()
        .enumerate()
        .map(|(rank, (position, score))| RerankResult {
            document: documents[position].clone(),
            score,
            rank: rank as u32 + 1,
        })
        .collect())
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Clone)]
pub struct ChatHandle {
    id: String,
    core: Arc<dyn Extension>,
    deadline: Option<Duration>,
}

impl ChatHandle {
    pub fn new(core: Arc<dyn Extension>) -> Result<Self> {
        let id = core.metadata().id.clone();
        if core.as_chat().is_none() {
            return Err(unsupported(&id, "Chat"));
        }
        Ok(Self {
            id,
            core,
            deadline: None,
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn inner(&self) -> Result<&dyn Chat> {
        self.core.as_chat().ok_or_else(|| unsupported(&self.id, "Chat"))
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if request.messages.is_empty() {
            return Err(ExtensionError::EmptyInput);
        }
        within(&self.id, self.deadline, self.inner()?.chat(request)).await
    }

    /// Stream chunks into `tx`, followed by [`STREAM_END_MARKER`] on success.
    ///
    /// Dropping the receiver cancels delivery; the extension sees `Cancelled`
    /// from its next send.
    pub async fn chat_stream(&self, request: &ChatRequest, tx: mpsc::Sender<Vec<u8>>) -> Result<()> {
        if request.messages.is_empty() {
            return Err(ExtensionError::EmptyInput);
        }
        let sink = ChunkSink::new(tx.clone());
        within(&self.id, self.deadline, self.inner()?.chat_stream(request, sink)).await?;
        tx.send(STREAM_END_MARKER.to_vec())
            .await
            .map_err(|_| ExtensionError::Cancelled("stream receiver dropped".to_string()))
    }
}
