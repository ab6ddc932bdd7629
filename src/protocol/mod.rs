//! MCP protocol: JSON-RPC 2.0 message types and the request correlation engine

pub mod engine;
pub mod types;

pub use engine::{parse_message, ProtocolEngine, DEFAULT_REQUEST_TIMEOUT};
pub use types::*;
