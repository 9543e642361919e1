//! Server and client settings.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use xpkg_core::ManagerConfig;

/// Default deadline for one remote call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on opening the RPC channel before the client settles on HTTP.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_RPC_TARGET: &str = "plugin-service:8003";
pub const DEFAULT_HTTP_URL: &str = "http://plugin-service:8002";

/// Largest accepted archive upload.
pub const MAX_UPLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Cap on one HTTP body or RPC frame: an upload plus envelope overhead.
pub const MAX_REQUEST_SIZE: usize = MAX_UPLOAD_SIZE + 64 * 1024;

/// Settings of the `xpkg-service` process.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub http_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    /// Root of the filesystem object store holding uploaded archives
    pub object_dir: PathBuf,
    pub manager: ManagerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8002)),
            rpc_addr: SocketAddr::from(([0, 0, 0, 0], 8003)),
            object_dir: PathBuf::from("./internal/objects"),
            manager: ManagerConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults overridden by `XPKG_HTTP_ADDR`, `XPKG_RPC_ADDR`,
    /// `XPKG_OBJECT_DIR` and the manager's own variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            manager: ManagerConfig::from_env(),
            ..Default::default()
        };
        if let Some(addr) = std::env::var("XPKG_HTTP_ADDR").ok().and_then(|v| v.parse().ok()) {
            config.http_addr = addr;
        }
        if let Some(addr) = std::env::var("XPKG_RPC_ADDR").ok().and_then(|v| v.parse().ok()) {
            config.rpc_addr = addr;
        }
        if let Ok(dir) = std::env::var("XPKG_OBJECT_DIR") {
            config.object_dir = PathBuf::from(dir);
        }
        config
    }
}

/// Settings of a [`PluginServiceClient`](crate::PluginServiceClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the RPC listener
    pub rpc_target: String,
    /// Base URL of the HTTP listener
    pub http_url: String,
    /// Deadline applied to every call
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Sent as `X-User-Id` on HTTP calls
    pub user_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_target: DEFAULT_RPC_TARGET.to_string(),
            http_url: DEFAULT_HTTP_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_id: None,
        }
    }
}

impl ClientConfig {
    /// Reads `PLUGIN_SERVICE_GRPC_URL` and `PLUGIN_SERVICE_URL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(target) = std::env::var("PLUGIN_SERVICE_GRPC_URL") {
            if !target.trim().is_empty() {
                config.rpc_target = target;
            }
        }
        if let Ok(url) = std::env::var("PLUGIN_SERVICE_URL") {
            if !url.trim().is_empty() {
                config.http_url = url;
            }
        }
        config
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// RPC target without any URL scheme, ready for `TcpStream::connect`.
    pub fn rpc_socket(&self) -> &str {
        let target = self.rpc_target.trim();
        target
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(target)
            .trim_end_matches('/')
    }

    /// HTTP base URL without a trailing slash.
    pub fn http_base(&self) -> &str {
        self.http_url.trim().trim_end_matches('/')
    }
}
