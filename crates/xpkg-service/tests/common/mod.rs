//! A plugin service on loopback ports, backed by an in-memory echo host.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use xpkg_core::package::PackageBuilder;
use xpkg_core::prelude::*;
use xpkg_core::store::MemoryObjectStore;
use xpkg_core::{ExtensionHost, ExtensionManager, LocalPluginService, ManagerConfig, StagedPackage};
use xpkg_service::rpc::RpcServer;
use xpkg_service::{http, ClientConfig};

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

/// Embedding this text takes [`SLOW_DELAY`].
pub const SLOW_TEXT: &str = "slow";
pub const SLOW_DELAY: Duration = Duration::from_secs(1);

/// Embeds text as `[len, 1, 0]`; scores documents by length.
pub struct EchoExtension {
    manifest: Manifest,
    ready: AtomicBool,
}

#[async_trait::async_trait]
impl Extension for EchoExtension {
    fn metadata(&self) -> &Manifest {
        &self.manifest
    }

    async fn initialize(&self, _config: &ExtensionConfig) -> Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> Result<()> {
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        Ok(())
    }

    async fn reload_config(&self, _config: &ExtensionConfig) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn as_embedder(&self) -> Option<&dyn Embedder> {
        Some(self)
    }

    fn as_reranker(&self) -> Option<&dyn Reranker> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Embedder for EchoExtension {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text == SLOW_TEXT {
            tokio::time::sleep(SLOW_DELAY).await;
        }
        Ok(vec![text.len() as f32, 1.0, 0.0])
    }

    fn dimensions(&self) -> usize {
        3
    }
}

#[async_trait::async_trait]
impl Reranker for EchoExtension {
    async fn rerank(&self, _query: &str, documents: &[RerankDocument]) -> Result<Vec<RerankResult>> {
        Ok(documents
            .iter()
            .map(|doc| RerankResult {
                document: doc.clone(),
                score: doc.content.len() as f64,
                rank: 0,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct EchoHost {
    pub instantiated: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ExtensionHost for EchoHost {
    fn kind(&self) -> &'static str {
        "echo"
    }

    async fn instantiate(&self, package: &StagedPackage<'_>) -> Result<Arc<dyn Extension>> {
        self.instantiated.lock().push(package.manifest.id.clone());
        Ok(Arc::new(EchoExtension {
            manifest: package.manifest.clone(),
            ready: AtomicBool::new(false),
        }))
    }
}

/// Package `manifest_json` plus a dummy binary into `<dir>/<name>.xpkg`.
pub fn pack(dir: &Path, name: &str, manifest_json: &str) -> PathBuf {
    let input = dir.join(format!("{}-src", name));
    std::fs::create_dir_all(&input).unwrap();
    std::fs::write(input.join("manifest.json"), manifest_json).unwrap();
    std::fs::write(input.join("plugin.so"), b"\x7fELF echo").unwrap();

    let output = dir.join(format!("{}.xpkg", name));
    PackageBuilder::new(&input).build(&output).unwrap();
    output
}

/// Persist `enabled: false` for `id` in a manager rooted at `root`.
pub fn write_disabled_config(root: &Path, id: &str) {
    let dir = root.join("config");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{}.json", id)),
        serde_json::to_vec_pretty(&ExtensionConfig::disabled(id)).unwrap(),
    )
    .unwrap();
}

pub struct TestServer {
    pub root: tempfile::TempDir,
    pub manager: Arc<ExtensionManager>,
    pub objects: Arc<MemoryObjectStore>,
    pub rpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

impl TestServer {
    /// Both listeners run until the test runtime shuts down.
    pub async fn start() -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = ManagerConfig::rooted(root.path());
        let manager = Arc::new(ExtensionManager::new(config, Arc::new(EchoHost::default())).unwrap());
        let objects = Arc::new(MemoryObjectStore::new());
        let service: Arc<dyn PluginOperations> =
            Arc::new(LocalPluginService::new(manager.clone(), objects.clone()));

        let rpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_addr = rpc_listener.local_addr().unwrap();
        let http_addr = http_listener.local_addr().unwrap();

        tokio::spawn(RpcServer::new(service.clone()).serve(rpc_listener, std::future::pending()));
        tokio::spawn(http::serve(http_listener, service, std::future::pending()));

        Self {
            root,
            manager,
            objects,
            rpc_addr,
            http_addr,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            rpc_target: self.rpc_addr.to_string(),
            http_url: format!("http://{}", self.http_addr),
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            user_id: Some("tester".to_string()),
        }
    }

    /// Client config whose RPC target refuses connections.
    pub async fn http_only_config(&self) -> ClientConfig {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);
        ClientConfig {
            rpc_target: closed_addr.to_string(),
            ..self.client_config()
        }
    }

    pub fn demo_archive(&self) -> Vec<u8> {
        std::fs::read(pack(self.root.path(), "demo", DEMO_MANIFEST)).unwrap()
    }
}
