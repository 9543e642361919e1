//! Test doubles shared by the integration tests.
//!
//! `StubHost` stands in for the native host: instead of opening the packaged
//! binary it builds a `StubExtension` from the staged manifest.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use xpkg_core::config::{ConfigManager, EnvSource};
use xpkg_core::extension::ChunkSink;
use xpkg_core::package::PackageBuilder;
use xpkg_core::prelude::*;
use xpkg_core::{ExtensionHost, ExtensionManager, ManagerConfig, StagedPackage};

pub const DEMO_MANIFEST: &str = r#"{
    "id": "demo",
    "name": "Demo",
    "version": "1.0.0",
    "provider": "demo-ai",
    "capabilities": [
        {"type": "embedding", "models": ["m1"]},
        {"type": "rerank", "models": ["r1"]}
    ]
}"#;

/// How a stub extension misbehaves.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub fail_initialize: bool,
    pub fail_enable: bool,
    pub fail_reload: bool,
    pub fail_cleanup: bool,
    /// Report this id instead of the manifest's
    pub report_id: Option<String>,
    /// Served by `models(api_key)`; `None` means not supported
    pub live_models: Option<Vec<String>>,
    /// The host refuses to instantiate with this load error
    pub load_error: Option<String>,
    /// Declared capabilities are not exposed as adapters
    pub hide_adapters: bool,
    /// `enable` parks until this is notified
    pub enable_gate: Option<Arc<Notify>>,
}

pub struct StubExtension {
    manifest: Manifest,
    behavior: Behavior,
    ready: AtomicBool,
    enabled: AtomicBool,
    pub cleanups: AtomicUsize,
    pub reloads: AtomicUsize,
    pub enable_calls: AtomicUsize,
}

impl StubExtension {
    pub fn new(mut manifest: Manifest, behavior: Behavior) -> Self {
        if let Some(id) = &behavior.report_id {
            manifest.id = id.clone();
        }
        Self {
            manifest,
            behavior,
            ready: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            cleanups: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
            enable_calls: AtomicUsize::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

fn refuse(what: &str) -> ExtensionError {
    ExtensionError::Validation(format!("stub refused to {}", what))
}

#[async_trait::async_trait]
impl Extension for StubExtension {
    fn metadata(&self) -> &Manifest {
        &self.manifest
    }

    async fn initialize(&self, _config: &ExtensionConfig) -> Result<()> {
        if self.behavior.fail_initialize {
            return Err(refuse("initialize"));
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> Result<()> {
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.behavior.enable_gate {
            gate.notified().await;
        }
        if self.behavior.fail_enable {
            return Err(refuse("enable"));
        }
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn reload_config(&self, _config: &ExtensionConfig) -> Result<()> {
        if self.behavior.fail_reload {
            return Err(refuse("reload"));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_cleanup {
            return Err(refuse("clean up"));
        }
        Ok(())
    }

    fn as_embedder(&self) -> Option<&dyn Embedder> {
        if !self.behavior.hide_adapters && self.manifest.has_capability(CapabilityType::Embedding) {
            Some(self)
        } else {
            None
        }
    }

    fn as_reranker(&self) -> Option<&dyn Reranker> {
        if !self.behavior.hide_adapters && self.manifest.has_capability(CapabilityType::Rerank) {
            Some(self)
        } else {
            None
        }
    }

    fn as_chat(&self) -> Option<&dyn Chat> {
        if !self.behavior.hide_adapters && self.manifest.has_capability(CapabilityType::Chat) {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl Embedder for StubExtension {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vec![text.len() as f32, 1.0, 0.5, 0.25])
    }

    fn dimensions(&self) -> usize {
        4
    }

    async fn models(&self, _api_key: &str) -> Result<Vec<String>> {
        self.behavior
            .live_models
            .clone()
            .ok_or_else(|| ExtensionError::NotImplemented("model listing".to_string()))
    }
}

#[async_trait::async_trait]
impl Reranker for StubExtension {
    /// Longer documents score higher; results come back in reverse input order.
    async fn rerank(&self, _query: &str, documents: &[RerankDocument]) -> Result<Vec<RerankResult>> {
        Ok(documents
            .iter()
            .rev()
            .map(|doc| RerankResult {
                document: doc.clone(),
                score: doc.content.len() as f64,
                rank: 0,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl Chat for StubExtension {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatResponse {
            id: "chat-1".to_string(),
            model: request.model.clone(),
            choices: vec![xpkg_core::extension::ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: last,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: Default::default(),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest, sink: ChunkSink) -> Result<()> {
        for message in &request.messages {
            for word in message.content.split_whitespace() {
                sink.send(word.as_bytes().to_vec()).await?;
            }
        }
        Ok(())
    }
}

/// Host building stub extensions; behaviour is configured per manifest id.
#[derive(Default)]
pub struct StubHost {
    behaviors: Mutex<HashMap<String, Behavior>>,
    pub instances: Mutex<Vec<Arc<StubExtension>>>,
}

impl StubHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_behavior(&self, id: &str, behavior: Behavior) {
        self.behaviors.lock().insert(id.to_string(), behavior);
    }

    pub fn last_instance(&self) -> Option<Arc<StubExtension>> {
        self.instances.lock().last().cloned()
    }
}

#[async_trait::async_trait]
impl ExtensionHost for StubHost {
    fn kind(&self) -> &'static str {
        "stub"
    }

    async fn instantiate(&self, package: &StagedPackage<'_>) -> Result<Arc<dyn Extension>> {
        assert!(package.binary.is_file(), "binary must be staged");
        assert!(package.root.is_dir(), "sandbox must exist during instantiation");

        let behavior = self
            .behaviors
            .lock()
            .get(&package.manifest.id)
            .cloned()
            .unwrap_or_default();
        if let Some(message) = &behavior.load_error {
            return Err(ExtensionError::Load(message.clone()));
        }
        let instance = Arc::new(StubExtension::new(package.manifest.clone(), behavior));
        self.instances.lock().push(instance.clone());
        Ok(instance)
    }
}

/// Package `manifest_json` plus a dummy binary into `<dir>/<name>.xpkg`.
pub fn pack(dir: &Path, name: &str, manifest_json: &str) -> PathBuf {
    let input = dir.join(format!("{}-src", name));
    fs::create_dir_all(&input).unwrap();
    fs::write(input.join("manifest.json"), manifest_json).unwrap();
    fs::write(input.join("plugin.so"), b"\x7fELF stub").unwrap();

    let output = dir.join(format!("{}.xpkg", name));
    PackageBuilder::new(&input).build(&output).unwrap();
    output
}

pub fn manifest_json(id: &str, capabilities: &str) -> String {
    format!(
        r#"{{"id":"{}","name":"{}","version":"1.0.0","capabilities":{}}}"#,
        id, id, capabilities
    )
}

pub fn fixed_env(vars: &[(&str, &str)]) -> EnvSource {
    EnvSource::Fixed(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// Manager rooted in `root` with file-backed configs and a fixed environment.
pub fn manager(root: &Path, host: Arc<StubHost>, env: &[(&str, &str)]) -> ExtensionManager {
    let config = ManagerConfig::rooted(root);
    let configs = ConfigManager::file_backed(&config.config_dir).with_env(fixed_env(env));
    ExtensionManager::with_config_manager(config, host, configs).unwrap()
}

/// Write a persisted config file the way the config manager does.
pub fn write_config(root: &Path, config: &ExtensionConfig) {
    let dir = root.join("config");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join(format!("{}.json", config.extension_id)),
        serde_json::to_vec_pretty(config).unwrap(),
    )
    .unwrap();
}
