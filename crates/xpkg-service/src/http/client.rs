//! HTTP client for the fallback transport.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use xpkg_core::extension::{RerankDocument, RerankResult};
use xpkg_core::service::{Embedding, ModelCatalog, PluginConfigView, PluginSummary, UploadReceipt};
use xpkg_core::{ExtensionError, PluginOperations, Result};

use super::handlers::USER_ID_HEADER;
use super::models::{
    ApiResponse, EmbedBatchRequest, EmbedRequest, ModelsRequest, PluginAck, RerankRequest,
    UpdateConfigRequest,
};

/// Bodies a gateway serves when no instance of the service is up.
const UNREACHABLE_MARKERS: [&str; 2] = ["no healthy upstream", "Service Unavailable"];

pub struct HttpClient {
    base: String,
    client: reqwest::Client,
    user_id: Option<String>,
}

impl HttpClient {
    pub fn new(base_url: &str, timeout: Duration, user_id: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtensionError::Transport(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
            user_id,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base, path));
        match &self.user_id {
            Some(user_id) => builder.header(USER_ID_HEADER, user_id),
            None => builder,
        }
    }

    fn plugin_path(plugin_id: &str, action: &str) -> String {
        if action.is_empty() {
            format!("/api/plugins/{}", plugin_id)
        } else {
            format!("/api/plugins/{}/{}", plugin_id, action)
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExtensionError::Transport(format!("request timed out: {}", e))
            } else {
                ExtensionError::Transport(format!("request failed: {}", e))
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExtensionError::Transport(format!("cannot read response body: {}", e)))?;
        decode(status, &body)
    }
}

/// Turn a status and body into the payload or a classified error.
pub fn decode<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T> {
    if !status.is_success() {
        if UNREACHABLE_MARKERS.iter().any(|marker| body.contains(marker)) {
            return Err(ExtensionError::ServiceUnreachable(format!(
                "{}: {}",
                status,
                body.trim()
            )));
        }
        return Err(match serde_json::from_str::<ApiResponse<Value>>(body) {
            Ok(ApiResponse {
                error: Some(error), ..
            }) => ExtensionError::Rejected {
                code: error.code,
                message: error.message,
            },
            _ => ExtensionError::Rejected {
                code: format!("HTTP_{}", status.as_u16()),
                message: if body.trim().is_empty() {
                    status.to_string()
                } else {
                    body.trim().to_string()
                },
            },
        });
    }

    let envelope: ApiResponse<T> = serde_json::from_str(body)
        .map_err(|e| ExtensionError::Transport(format!("invalid response body: {}", e)))?;
    if !envelope.success {
        let (code, message) = envelope
            .error
            .map(|e| (e.code, e.message))
            .unwrap_or_else(|| ("UNKNOWN".to_string(), "request failed".to_string()));
        return Err(ExtensionError::Rejected { code, message });
    }
    envelope
        .data
        .ok_or_else(|| ExtensionError::Transport("response without data".to_string()))
}

#[async_trait::async_trait]
impl PluginOperations for HttpClient {
    async fn upload_plugin(&self, filename: &str, content: Vec<u8>) -> Result<UploadReceipt> {
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str("application/zip")
            .map_err(|e| ExtensionError::Transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        self.send(self.request(Method::POST, "/api/plugins/upload").multipart(form))
            .await
    }

    async fn list_plugins(&self) -> Result<Vec<PluginSummary>> {
        self.send(self.request(Method::GET, "/api/plugins")).await
    }

    async fn get_models(&self, plugin_id: &str, api_key: Option<&str>) -> Result<ModelCatalog> {
        let body = ModelsRequest {
            api_key: api_key.map(str::to_string),
        };
        self.send(
            self.request(Method::POST, &Self::plugin_path(plugin_id, "models"))
                .json(&body),
        )
        .await
    }

    async fn enable_plugin(&self, plugin_id: &str) -> Result<()> {
        let _: PluginAck = self
            .send(self.request(Method::POST, &Self::plugin_path(plugin_id, "enable")))
            .await?;
        Ok(())
    }

    async fn disable_plugin(&self, plugin_id: &str) -> Result<()> {
        let _: PluginAck = self
            .send(self.request(Method::POST, &Self::plugin_path(plugin_id, "disable")))
            .await?;
        Ok(())
    }

    async fn delete_plugin(&self, plugin_id: &str) -> Result<()> {
        let _: PluginAck = self
            .send(self.request(Method::DELETE, &Self::plugin_path(plugin_id, "")))
            .await?;
        Ok(())
    }

    async fn embed(&self, plugin_id: &str, text: &str) -> Result<Embedding> {
        let body = EmbedRequest {
            text: text.to_string(),
        };
        self.send(
            self.request(Method::POST, &Self::plugin_path(plugin_id, "embed"))
                .json(&body),
        )
        .await
    }

    async fn embed_batch(&self, plugin_id: &str, texts: &[String]) -> Result<Vec<Embedding>> {
        let body = EmbedBatchRequest {
            texts: texts.to_vec(),
        };
        self.send(
            self.request(Method::POST, &Self::plugin_path(plugin_id, "embed_batch"))
                .json(&body),
        )
        .await
    }

    async fn rerank(
        &self,
        plugin_id: &str,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RerankResult>> {
        let body = RerankRequest {
            query: query.to_string(),
            documents: documents.to_vec(),
        };
        self.send(
            self.request(Method::POST, &Self::plugin_path(plugin_id, "rerank"))
                .json(&body),
        )
        .await
    }

    async fn get_plugin_config(&self, plugin_id: &str) -> Result<PluginConfigView> {
        self.send(self.request(Method::GET, &Self::plugin_path(plugin_id, "config")))
            .await
    }

    async fn update_plugin_config(&self, plugin_id: &str, settings: Map<String, Value>) -> Result<()> {
        let body = UpdateConfigRequest { settings };
        let _: PluginConfigView = self
            .send(
                self.request(Method::PUT, &Self::plugin_path(plugin_id, "config"))
                    .json(&body),
            )
            .await?;
        Ok(())
    }
}
