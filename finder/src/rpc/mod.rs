//! Stdio RPC
//!
//! - [`StdioRpcClient`]: line-delimited JSON-RPC over a tool server's pipes
//! - [`ToolBackend`]: the two remote primitives the pipeline drives

mod client;
mod error;

pub use client::{ChildRpcClient, StdioRpcClient, DEFAULT_CALL_TIMEOUT};
pub use error::RpcError;

use async_trait::async_trait;
use serde_json::Value;

/// Remote search/fetch surface of one tool server
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Invoke a named remote operation (`tools/call`)
    async fn invoke(&self, operation: &str, arguments: Value) -> anyhow::Result<Value>;

    /// Read a named remote resource (`resources/read`)
    async fn read_resource(&self, uri: &str) -> anyhow::Result<String>;
}
