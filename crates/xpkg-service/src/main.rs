//! Plugin service: serves the extension runtime over RPC and HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use xpkg_core::store::FsObjectStore;
use xpkg_core::{ExtensionManager, LocalPluginService, NativeHost, PluginOperations};
use xpkg_service::rpc::RpcServer;
use xpkg_service::{http, ServiceConfig};

/// xpkg plugin service
#[derive(Parser, Debug)]
#[command(name = "xpkg-service")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP listen address.
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// RPC listen address.
    #[arg(long)]
    rpc_addr: Option<SocketAddr>,

    /// Directory scanned for `.xpkg` archives.
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Extraction and library staging directory.
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Persisted extension configs.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Object storage root for uploaded archives.
    #[arg(long)]
    object_dir: Option<PathBuf>,

    /// Discover and load archives from the plugin directory at startup.
    #[arg(long)]
    auto_discover: bool,
}

impl Args {
    fn into_config(self) -> ServiceConfig {
        let mut config = ServiceConfig::from_env();
        if let Some(addr) = self.http_addr {
            config.http_addr = addr;
        }
        if let Some(addr) = self.rpc_addr {
            config.rpc_addr = addr;
        }
        if let Some(dir) = self.plugin_dir {
            config.manager.plugin_dir = dir;
        }
        if let Some(dir) = self.temp_dir {
            config.manager.temp_dir = dir;
        }
        if let Some(dir) = self.config_dir {
            config.manager.config_dir = dir;
        }
        if let Some(dir) = self.object_dir {
            config.object_dir = dir;
        }
        if self.auto_discover {
            config.manager.auto_discover = true;
            config.manager.auto_load = true;
        }
        config
    }
}

fn init_tracing() {
    let json_logging = std::env::var("XPKG_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("xpkg=info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}

/// Resolves once `rx` observes the shutdown flag.
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Args::parse().into_config();

    let host = Arc::new(NativeHost::new(config.manager.temp_dir.join("libs")));
    let manager = Arc::new(
        ExtensionManager::new(config.manager.clone(), host).context("creating extension manager")?,
    );
    manager.start().await.context("starting extension manager")?;

    let objects = Arc::new(FsObjectStore::new(&config.object_dir));
    let service: Arc<dyn PluginOperations> = Arc::new(LocalPluginService::new(manager.clone(), objects));

    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.http_addr))?;
    let rpc_listener = TcpListener::bind(config.rpc_addr)
        .await
        .with_context(|| format!("binding RPC listener on {}", config.rpc_addr))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let http = http::serve(http_listener, service.clone(), stopped(stop_rx.clone()));
    let rpc = RpcServer::new(service).serve(rpc_listener, stopped(stop_rx));
    let plugins = manager.registry().count().await;
    tracing::info!(
        http = %config.http_addr,
        rpc = %config.rpc_addr,
        plugins,
        "Plugin service ready"
    );

    let served = futures::future::try_join(http, rpc).await;

    manager.shutdown().await;
    served.context("serving plugin requests")?;
    tracing::info!("Plugin service stopped");
    Ok(())
}
