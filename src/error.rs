//! Error types for a3s-mcp

use thiserror::Error;

use crate::protocol::types::{error_codes, RequestId};

/// Errors that can occur in the MCP runtime
#[derive(Debug, Error)]
pub enum McpError {
    /// Inbound bytes were not valid JSON
    #[error("Parse error: {0}")]
    Parse(String),

    /// Valid JSON that violates the JSON-RPC 2.0 envelope rules
    #[error("Invalid JSON-RPC message: {}", violations.join("; "))]
    InvalidMessage { violations: Vec<String> },

    /// Requested protocol version is not in the supported set
    #[error("Unsupported protocol version '{requested}' (supported: {})", supported.join(", "))]
    UnsupportedProtocolVersion {
        requested: String,
        supported: Vec<String>,
    },

    /// Peer answered a request with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not receive its response in time
    #[error("Request {id} ({method}) timed out after {elapsed_ms}ms")]
    RequestTimeout {
        id: RequestId,
        method: String,
        elapsed_ms: u128,
    },

    /// Startup, shutdown, sampling or other operation deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Spawn failure, unexpected exit or kill failure
    #[error("Process error for '{server}': {msg}")]
    Process { server: String, msg: String },

    /// No server registered under this name
    #[error("Unknown server: '{0}'")]
    UnknownServer(String),

    /// Malformed sampling params/results or other caller input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation aborted through its cancellation token
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Transport send/receive failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection torn down while the operation was in flight
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Dependency walk revisited a server already on the current path
    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    /// Several per-server failures collected by a batch operation
    #[error("{0}")]
    Aggregate(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sampling channel unavailable or saturated
    #[error("Sampling error: {0}")]
    Sampling(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl McpError {
    /// JSON-RPC error code used when this error answers an inbound request
    pub fn code(&self) -> i32 {
        match self {
            McpError::Parse(_) => error_codes::PARSE_ERROR,
            McpError::InvalidMessage { .. } => error_codes::INVALID_REQUEST,
            McpError::Validation(_) | McpError::Serialization(_) => error_codes::INVALID_PARAMS,
            McpError::UnsupportedProtocolVersion { .. } => error_codes::INVALID_PARAMS,
            McpError::Rpc { code, .. } => *code,
            McpError::UnknownServer(_) => error_codes::METHOD_NOT_FOUND,
            McpError::Io(_) => error_codes::INTERNAL_ERROR,
            _ => error_codes::SERVER_ERROR,
        }
    }

    /// Taxonomy bucket, stable across variants of the same family
    pub fn category(&self) -> &'static str {
        match self {
            McpError::Parse(_)
            | McpError::InvalidMessage { .. }
            | McpError::UnsupportedProtocolVersion { .. }
            | McpError::Rpc { .. } => "protocol",
            McpError::RequestTimeout { .. } | McpError::Timeout(_) => "timeout",
            McpError::Process { .. } | McpError::UnknownServer(_) => "process",
            McpError::Validation(_) | McpError::Config(_) => "validation",
            McpError::Cancelled { .. } => "cancellation",
            McpError::Transport(_) | McpError::ConnectionClosed(_) | McpError::Io(_) => "transport",
            McpError::DependencyCycle(_) | McpError::Aggregate(_) => "lifecycle",
            McpError::Sampling(_) => "sampling",
            McpError::Serialization(_) => "serialization",
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.category() == "timeout"
    }

    pub(crate) fn process(server: &str, msg: impl Into<String>) -> Self {
        McpError::Process {
            server: server.to_string(),
            msg: msg.into(),
        }
    }
}

/// Result type alias for MCP runtime operations
pub type Result<T> = std::result::Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_message_lists_every_violation() {
        let err = McpError::InvalidMessage {
            violations: vec!["jsonrpc must be \"2.0\"".into(), "missing id".into()],
        };
        let text = err.to_string();
        assert!(text.contains("jsonrpc"));
        assert!(text.contains("missing id"));
        assert_eq!(err.code(), error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_request_timeout_message() {
        let err = McpError::RequestTimeout {
            id: RequestId::Number(7),
            method: "tools/list".into(),
            elapsed_ms: 50,
        };
        assert_eq!(err.to_string(), "Request 7 (tools/list) timed out after 50ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_rpc_error_keeps_peer_code() {
        let err = McpError::Rpc {
            code: -32601,
            message: "nope".into(),
            data: None,
        };
        assert_eq!(err.code(), -32601);
        assert_eq!(err.category(), "protocol");
    }

    #[test]
    fn test_categories() {
        assert_eq!(McpError::process("fs", "boom").category(), "process");
        assert_eq!(McpError::Validation("x".into()).category(), "validation");
        assert_eq!(
            McpError::Cancelled {
                reason: "timeout".into()
            }
            .category(),
            "cancellation"
        );
        assert_eq!(McpError::Parse("x".into()).code(), -32700);
    }
}
