//! Primary transport: length-prefixed bincode frames over TCP.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RpcClient;
pub use protocol::{RpcBody, RpcError, RpcRequest, RpcResponse, MAX_FRAME_SIZE};
pub use server::RpcServer;
