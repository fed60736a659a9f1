//! Finder Common - shared utilities for the workspace-finder host and tool servers
//!
//! - **Initialization**: [`init_tracing`] for stderr logging
//! - **Protocol**: newline-delimited JSON-RPC envelopes spoken over stdio
//!
//! # Example
//!
//! ```rust,ignore
//! use finder_common::{init_tracing, RpcRequest, METHOD_TOOLS_CALL};
//!
//! init_tracing("workspace_finder")?;
//! let request = RpcRequest::new(1, METHOD_TOOLS_CALL, serde_json::json!({"name": "search"}));
//! ```

pub mod init;
pub mod protocol;

pub use init::init_tracing;
pub use protocol::{
    CallToolParams, ClientInfo, InitializeParams, ReadResourceParams, ReadResourceResult,
    ResourceContents, ResponseBody, RpcErrorObject, RpcRequest, RpcResponse, JSONRPC_VERSION,
    METHOD_INITIALIZE, METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, PROTOCOL_VERSION,
};
