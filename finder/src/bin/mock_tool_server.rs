//! Mock tool server - a stdio tool server with canned search results
//!
//! Prints one readiness line, then answers `initialize`, `tools/call` and
//! `resources/read` requests, one JSON line each. Used by the integration
//! tests and as a fallback command for local runs.

use anyhow::Result;
use base64::Engine;
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use finder_common::{
    CallToolParams, ReadResourceParams, RpcErrorObject, RpcRequest, RpcResponse,
    METHOD_INITIALIZE, METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, PROTOCOL_VERSION,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "mock-tool-server")]
#[command(about = "Stdio tool server returning canned search results")]
struct Args {
    /// Service name used in titles and URIs
    #[arg(long, default_value = "mock")]
    name: String,

    /// Number of hits returned by the search tool
    #[arg(long, default_value_t = 5)]
    hits: usize,

    /// Serve resources as base64 blobs instead of text
    #[arg(long)]
    blob: bool,

    /// Answer every tool call with a 429 error
    #[arg(long)]
    rate_limited: bool,
}

impl Args {
    fn handle(&self, request: &RpcRequest) -> std::result::Result<Value, RpcErrorObject> {
        match request.method.as_str() {
            METHOD_INITIALIZE => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": self.name, "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {"tools": {}, "resources": {}},
            })),
            METHOD_TOOLS_CALL => {
                let params: CallToolParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| RpcErrorObject::invalid_params(e.to_string()))?;
                if self.rate_limited {
                    return Err(RpcErrorObject::internal("HTTP 429: rate limit exceeded"));
                }
                Ok(json!({"content": self.call_tool(&params)?}))
            }
            METHOD_RESOURCES_READ => {
                let params: ReadResourceParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| RpcErrorObject::invalid_params(e.to_string()))?;
                Ok(self.read_resource(&params.uri))
            }
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }

    fn call_tool(&self, params: &CallToolParams) -> std::result::Result<Value, RpcErrorObject> {
        match params.name.as_str() {
            "search" => {
                let query = params.arguments["query"].as_str().unwrap_or_default();
                let limit = params.arguments["limit"]
                    .as_u64()
                    .map_or(self.hits, |limit| (limit as usize).min(self.hits));
                let hits: Vec<Value> = (0..limit)
                    .map(|i| {
                        json!({
                            "title": format!("{} result {} for {}", self.name, i, query),
                            "snippet": format!("snippet {} from {}", i, self.name),
                            "uri": format!("{}://doc/{}", self.name, i),
                            "kind": "document",
                        })
                    })
                    .collect();
                Ok(json!([{"type": "text", "text": Value::Array(hits).to_string()}]))
            }
            "fetch" => {
                let uri = params.arguments["uri"].as_str().unwrap_or_default();
                Ok(json!([{"type": "text", "text": format!("body of {}", uri)}]))
            }
            other => Err(RpcErrorObject::invalid_params(format!("unknown tool: {}", other))),
        }
    }

    fn read_resource(&self, uri: &str) -> Value {
        let body = format!("contents of {}", uri);
        if self.blob {
            let encoded = base64::engine::general_purpose::STANDARD.encode(body.as_bytes());
            json!({"contents": [{"uri": uri, "mimeType": "text/plain", "blob": encoded}]})
        } else {
            json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": body}]})
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    finder_common::init_tracing("mock_tool_server")?;
    let args = Args::parse();

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("mock {} server ready\n", args.name).as_bytes())
        .await?;
    stdout.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => {
                tracing::debug!("{} <- {}", args.name, request.method);
                let id = Some(json!(request.id));
                match args.handle(&request) {
                    Ok(result) => RpcResponse::success(id, result),
                    Err(error) => RpcResponse::failure(id, error),
                }
            }
            Err(e) => RpcResponse::failure(None, RpcErrorObject::parse_error(format!("Parse error: {}", e))),
        };

        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}
