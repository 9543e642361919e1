//! Wire format of the RPC transport.
//!
//! Each message is one frame:
//!
//! ```text
//! +----------------+---------------------------+
//! | length: u32 BE | bincode(RpcRequest | RpcResponse) |
//! +----------------+---------------------------+
//! ```
//!
//! Free-form settings travel as JSON text inside the frame, since bincode
//! cannot carry `serde_json::Value`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use xpkg_core::extension::{RerankDocument, RerankResult};
use xpkg_core::service::{Embedding, PluginSummary, UploadReceipt};
use xpkg_core::ExtensionError;

use crate::config::MAX_REQUEST_SIZE;

/// Upper bound on one frame body. Uploads travel whole in a single frame.
pub const MAX_FRAME_SIZE: usize = MAX_REQUEST_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("connection closed")]
    Closed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
}

impl From<FrameError> for ExtensionError {
    fn from(err: FrameError) -> Self {
        ExtensionError::Transport(err.to_string())
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    UploadPlugin { filename: String, content: Vec<u8> },
    ListPlugins,
    GetModels { plugin_id: String, api_key: Option<String> },
    EnablePlugin { plugin_id: String },
    DisablePlugin { plugin_id: String },
    DeletePlugin { plugin_id: String },
    Embed { plugin_id: String, text: String },
    EmbedBatch { plugin_id: String, texts: Vec<String> },
    Rerank {
        plugin_id: String,
        query: String,
        documents: Vec<RerankDocument>,
    },
    GetPluginConfig { plugin_id: String },
    /// `settings_json` is a JSON object
    UpdatePluginConfig { plugin_id: String, settings_json: String },
}

impl RpcRequest {
    /// Operation name used in logs.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::UploadPlugin { .. } => "UploadPlugin",
            Self::ListPlugins => "ListPlugins",
            Self::GetModels { .. } => "GetModels",
            Self::EnablePlugin { .. } => "EnablePlugin",
            Self::DisablePlugin { .. } => "DisablePlugin",
            Self::DeletePlugin { .. } => "DeletePlugin",
            Self::Embed { .. } => "Embed",
            Self::EmbedBatch { .. } => "EmbedBatch",
            Self::Rerank { .. } => "Rerank",
            Self::GetPluginConfig { .. } => "GetPluginConfig",
            Self::UpdatePluginConfig { .. } => "UpdatePluginConfig",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcBody {
    Uploaded(UploadReceipt),
    Plugins(Vec<PluginSummary>),
    /// `(capability, models)` pairs
    Models(Vec<(String, Vec<String>)>),
    Done,
    Embedding(Embedding),
    Embeddings(Vec<Embedding>),
    Reranked(Vec<RerankResult>),
    Config {
        plugin_id: String,
        enabled: bool,
        settings_json: String,
    },
}

/// Envelope of every answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    pub error: Option<RpcError>,
    pub body: Option<RpcBody>,
}

impl RpcResponse {
    pub fn ok(body: RpcBody) -> Self {
        Self {
            success: true,
            error: None,
            body: Some(body),
        }
    }

    pub fn failed(err: &ExtensionError) -> Self {
        Self {
            success: false,
            error: Some(RpcError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
            body: None,
        }
    }

    /// Body of a successful response; refusals become [`ExtensionError::Rejected`].
    pub fn into_body(self) -> Result<RpcBody, ExtensionError> {
        if !self.success {
            let error = self.error.unwrap_or_else(|| RpcError {
                code: "UNKNOWN".to_string(),
                message: "request failed without an error".to_string(),
            });
            return Err(ExtensionError::Rejected {
                code: error.code,
                message: error.message,
            });
        }
        self.body
            .ok_or_else(|| ExtensionError::Transport("response without body".to_string()))
    }
}

// ============================================================================
// Framing
// ============================================================================

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean EOF before the header is [`FrameError::Closed`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    };
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_layout() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &RpcRequest::ListPlugins).await.unwrap();

        let declared = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        assert_eq!(declared, buffer.len() - 4);

        let mut reader = buffer.as_slice();
        let request: RpcRequest = read_frame(&mut reader).await.unwrap();
        assert_eq!(request, RpcRequest::ListPlugins);
        assert!(matches!(
            read_frame::<_, RpcRequest>(&mut reader).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buffer = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        buffer.extend_from_slice(&[0; 16]);
        let mut reader = buffer.as_slice();
        assert!(matches!(
            read_frame::<_, RpcRequest>(&mut reader).await,
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let mut buffer = 32u32.to_be_bytes().to_vec();
        buffer.extend_from_slice(&[1, 2, 3]);
        let mut reader = buffer.as_slice();
        let err = read_frame::<_, RpcRequest>(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
        assert!(ExtensionError::from(err).is_retryable());
    }

    #[test]
    fn test_refusal_becomes_rejected() {
        let response = RpcResponse::failed(&ExtensionError::NotFound("extension x".into()));
        match response.into_body() {
            Err(ExtensionError::Rejected { code, message }) => {
                assert_eq!(code, "NOT_FOUND");
                assert!(message.contains("extension x"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
