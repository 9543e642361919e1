//! Service boundary of the xpkg extension runtime.
//!
//! ```text
//!                    ┌──────────── xpkg-service ────────────┐
//! PluginServiceClient│ RpcServer  :8003  bincode frames      │
//!   ├─ RpcClient ────┼──►                                   ├─► LocalPluginService ─► ExtensionManager
//!   └─ HttpClient ───┼──► axum     :8002  JSON / multipart  │
//!                    └──────────────────────────────────────┘
//! ```
//!
//! Both transports carry the same operation set, [`PluginOperations`].

pub mod client;
pub mod config;
pub mod http;
pub mod remote;
pub mod rpc;

pub use client::{PluginServiceClient, Transport};
pub use config::{ClientConfig, ServiceConfig};
pub use remote::{RemoteEmbedder, RemoteExtension, RemoteHost, RemoteReranker};
pub use xpkg_core::PluginOperations;
