//! Stdio RPC client
//!
//! One client wraps one tool server's stdin/stdout. Requests are written as
//! single JSON lines with strictly increasing ids; the next matching line on
//! stdout is the response. All calls on a client go through one lock so a
//! single request is in flight per process, and the `initialize` handshake
//! happens lazily inside that same critical section.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use finder_common::{
    CallToolParams, InitializeParams, ReadResourceParams, ReadResourceResult, ResponseBody,
    RpcRequest, RpcResponse, METHOD_INITIALIZE, METHOD_RESOURCES_READ, METHOD_TOOLS_CALL,
};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::error::RpcError;
use super::ToolBackend;

/// Per-call response timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Name announced in the `initialize` handshake
const CLIENT_NAME: &str = "workspace-finder";

/// Client over a spawned tool server's pipes
pub type ChildRpcClient = StdioRpcClient<ChildStdin, BufReader<ChildStdout>>;

/// A request written but not yet answered
#[derive(Debug)]
struct PendingRequest {
    method: String,
    sent_at: Instant,
}

struct ClientState<W, R> {
    writer: W,
    reader: R,
    next_id: u64,
    initialized: bool,
    pending: HashMap<u64, PendingRequest>,
}

/// Line-delimited JSON-RPC client over any async byte pipe pair
pub struct StdioRpcClient<W, R> {
    service: String,
    call_timeout: Duration,
    state: Mutex<ClientState<W, R>>,
}

impl<W, R> StdioRpcClient<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(service: impl Into<String>, writer: W, reader: R) -> Self {
        Self {
            service: service.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            state: Mutex::new(ClientState {
                writer,
                reader,
                next_id: 1,
                initialized: false,
                pending: HashMap::new(),
            }),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Call a remote tool; returns the result's `content` field, or the whole result
    pub async fn invoke(&self, operation: &str, arguments: Value) -> Result<Value, RpcError> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let params = CallToolParams {
            name: operation.to_string(),
            arguments,
        };
        let result = self.request(&mut state, METHOD_TOOLS_CALL, params).await?;

        Ok(match result {
            Value::Object(mut map) => match map.remove("content") {
                Some(content) => content,
                None => Value::Object(map),
            },
            other => other,
        })
    }

    /// Read a remote resource as text, decoding a base64 blob when needed
    pub async fn read_resource(&self, uri: &str) -> Result<String, RpcError> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let result = self.request(&mut state, METHOD_RESOURCES_READ, params).await?;
        drop(state);

        let parsed: ReadResourceResult = serde_json::from_value(result)
            .map_err(|e| self.malformed(format!("resources/read result: {}", e)))?;

        let first = parsed
            .contents
            .into_iter()
            .next()
            .ok_or_else(|| self.malformed("resources/read returned no contents"))?;

        if let Some(text) = first.text {
            return Ok(text);
        }
        if let Some(blob) = first.blob {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(blob.trim())
                .map_err(|e| self.malformed(format!("invalid base64 blob: {}", e)))?;
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }

        Err(self.malformed("resources/read contents carry neither text nor blob"))
    }

    async fn ensure_initialized(&self, state: &mut ClientState<W, R>) -> Result<(), RpcError> {
        if state.initialized {
            return Ok(());
        }

        let params = InitializeParams::for_client(CLIENT_NAME, env!("CARGO_PKG_VERSION"));
        self.request(state, METHOD_INITIALIZE, params).await?;
        state.initialized = true;
        tracing::debug!("{}: initialize handshake complete", self.service);
        Ok(())
    }

    async fn request(
        &self,
        state: &mut ClientState<W, R>,
        method: &str,
        params: impl Serialize,
    ) -> Result<Value, RpcError> {
        let id = state.next_id;
        state.next_id += 1;

        let encode = |source| RpcError::Encode {
            service: self.service.clone(),
            source,
        };
        let params = serde_json::to_value(params).map_err(encode)?;
        let line = serde_json::to_string(&RpcRequest::new(id, method, params)).map_err(encode)?;

        // One request is in flight per client; leftovers belong to cancelled callers
        for (abandoned, pending) in state.pending.drain() {
            tracing::debug!(
                "{}: {} #{} abandoned after {:?}",
                self.service,
                pending.method,
                abandoned,
                pending.sent_at.elapsed()
            );
        }
        state.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                sent_at: Instant::now(),
            },
        );

        let outcome =
            tokio::time::timeout(self.call_timeout, state.exchange(&self.service, id, &line)).await;

        if let Some(pending) = state.pending.remove(&id) {
            tracing::debug!(
                "{}: {} #{} finished in {:?}",
                self.service,
                pending.method,
                id,
                pending.sent_at.elapsed()
            );
        }

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "{}: {} timed out after {:?}",
                    self.service,
                    method,
                    self.call_timeout
                );
                Err(RpcError::Timeout {
                    service: self.service.clone(),
                    method: method.to_string(),
                    timeout: self.call_timeout,
                })
            }
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> RpcError {
        RpcError::Malformed {
            service: self.service.clone(),
            reason: reason.into(),
        }
    }
}

impl<W, R> ClientState<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncBufRead + Unpin + Send,
{
    /// Write one request line and read until its response arrives
    async fn exchange(&mut self, service: &str, id: u64, line: &str) -> Result<Value, RpcError> {
        let io_err = |source| RpcError::Io {
            service: service.to_string(),
            source,
        };

        self.writer.write_all(line.as_bytes()).await.map_err(io_err)?;
        self.writer.write_all(b"\n").await.map_err(io_err)?;
        self.writer.flush().await.map_err(io_err)?;

        let mut buffer = String::new();
        loop {
            buffer.clear();
            let read = self.reader.read_line(&mut buffer).await.map_err(io_err)?;
            if read == 0 {
                return Err(RpcError::StreamClosed {
                    service: service.to_string(),
                });
            }

            let trimmed = buffer.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response: RpcResponse =
                serde_json::from_str(trimmed).map_err(|source| RpcError::InvalidJson {
                    service: service.to_string(),
                    source,
                })?;

            let got = response.numeric_id();
            if got != Some(id) {
                // Late answer to a request that already timed out
                if let Some(stale) = got.filter(|&got| got < id) {
                    self.pending.remove(&stale);
                    tracing::debug!("{}: dropping stale response #{}", service, stale);
                    continue;
                }
                // Notification
                if response.id.is_none() && response.error.is_none() {
                    continue;
                }
                if response.id.is_some() {
                    return Err(RpcError::IdMismatch {
                        service: service.to_string(),
                        expected: id,
                        got: response.id,
                    });
                }
            }

            return match response.into_result() {
                ResponseBody::Success(result) => Ok(result),
                ResponseBody::Failure(error) => Err(RpcError::Remote {
                    service: service.to_string(),
                    code: error.code,
                    message: error.message,
                }),
                ResponseBody::Malformed => Err(RpcError::Malformed {
                    service: service.to_string(),
                    reason: "response carries neither result nor error".to_string(),
                }),
            };
        }
    }
}

#[async_trait]
impl<W, R> ToolBackend for StdioRpcClient<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncBufRead + Unpin + Send,
{
    async fn invoke(&self, operation: &str, arguments: Value) -> anyhow::Result<Value> {
        Ok(StdioRpcClient::invoke(self, operation, arguments).await?)
    }

    async fn read_resource(&self, uri: &str) -> anyhow::Result<String> {
        Ok(StdioRpcClient::read_resource(self, uri).await?)
    }
}
