//! Stdio RPC error types

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a single RPC exchange
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("I/O error talking to {service}: {source}")]
    Io {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{service}: stream closed before a response arrived")]
    StreamClosed { service: String },

    #[error("{service}: {method} timed out after {:.1}s", .timeout.as_secs_f64())]
    Timeout {
        service: String,
        method: String,
        timeout: Duration,
    },

    #[error("{service}: failed to encode request: {source}")]
    Encode {
        service: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{service}: invalid JSON response: {source}")]
    InvalidJson {
        service: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{service}: malformed response: {reason}")]
    Malformed { service: String, reason: String },

    #[error("{service}: response id {got:?} does not match request id {expected}")]
    IdMismatch {
        service: String,
        expected: u64,
        got: Option<serde_json::Value>,
    },

    #[error("{service}: remote error {code}: {message}")]
    Remote {
        service: String,
        code: i64,
        message: String,
    },

    #[error("{service}: process pipes unavailable")]
    PipesUnavailable { service: String },
}

impl RpcError {
    /// Connection-level failures that a fresh attempt may not hit again
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Timeout { .. } => true,
            RpcError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            RpcError::Remote { code, message, .. } => {
                (500..600).contains(code) || is_server_error_message(message)
            }
            _ => false,
        }
    }

    /// The remote side reported a 429-style condition
    pub fn is_rate_limited(&self) -> bool {
        match self {
            RpcError::Remote { code, message, .. } => {
                *code == 429 || is_rate_limit_message(message)
            }
            _ => false,
        }
    }
}

fn is_rate_limit_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("429") || lowered.contains("rate limit")
}

fn is_server_error_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    ["500", "502", "503", "504", "connection reset", "temporarily unavailable"]
        .iter()
        .any(|needle| lowered.contains(needle))
}
