//! # a3s-mcp
//!
//! Model Context Protocol client runtime for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-mcp` spawns and supervises MCP server processes, speaks JSON-RPC 2.0
//! to them over stdio, and exposes their tools under one namespace. Requests
//! are correlated by id with per-request timeouts, can be cancelled, and
//! server-initiated traffic (notifications, `sampling/createMessage`,
//! `roots/list`) is routed to pluggable handlers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_mcp::{McpRuntime, RuntimeConfig, ServerConfig};
//!
//! # async fn example() -> a3s_mcp::Result<()> {
//! let config = RuntimeConfig::default().with_server(
//!     "fs",
//!     ServerConfig::new("npx").args(["-y", "@modelcontextprotocol/server-filesystem", "."]),
//! );
//! let runtime = McpRuntime::new(config);
//! runtime.register_all().await?;
//! runtime.connect("fs").await?;
//!
//! for (name, _tool) in runtime.all_tools().await {
//!     println!("{name}");
//! }
//! runtime.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ProtocolEngine**: message validation, id generation, response correlation
//! - **LifecycleSupervisor**: spawn, health checks, restart with backoff, dependency order
//! - **CancellationManager**: cancellation tokens with auto-cancel timeouts
//! - **NotificationRouter**: progress tracking, bounded history, handler fan-out
//! - **SamplingManager**: validated, capped, deadline-bound sampling callbacks
//! - **McpClient** / **McpRuntime**: one connection per server, assembled runtime

pub mod cancellation;
pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notifications;
pub mod protocol;
pub mod runtime;
pub mod sampling;
pub mod transport;

// Re-export core types
pub use cancellation::{
    CancellationEvent, CancellationManager, CancellationReason, CancellationResult,
    CancellationToken, RegisterOptions,
};
pub use client::{ClientContext, McpClient};
pub use config::{RestartPolicy, RuntimeConfig, ServerConfig};
pub use error::{McpError, Result};
pub use lifecycle::{
    LifecycleEvent, LifecycleSupervisor, ServerProcess, ServerState, StartOptions, StopOptions,
};
pub use notifications::{
    HistoryFilter, NotificationRecord, NotificationRouter, NotificationType, ProgressState,
    RouterEvent,
};
pub use protocol::{parse_message, ProtocolEngine};
pub use runtime::{parse_tool_name, McpRuntime, McpServerStatus};
pub use sampling::{SamplingCallback, SamplingEvent, SamplingManager};
pub use transport::{McpTransport, MemoryTransport, StdioTransport};
