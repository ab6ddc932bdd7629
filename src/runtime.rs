//! MCP Runtime
//!
//! Supervises MCP server processes and provides unified access to their tools.

use crate::cancellation::{CancellationManager, CancellationReason};
use crate::client::{ClientContext, McpClient};
use crate::config::{RuntimeConfig, ServerConfig};
use crate::error::{McpError, Result};
use crate::lifecycle::{
    LifecycleEvent, LifecycleSupervisor, ServerState, StartOptions, StopOptions,
};
use crate::notifications::{NotificationRouter, NotificationType};
use crate::protocol::types::{CallToolResult, McpTool};
use crate::sampling::SamplingManager;
use crate::transport::StdioTransport;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

const TOOL_PREFIX: &str = "mcp__";
const TOOL_SEPARATOR: &str = "__";

/// Snapshot of one configured server
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerStatus {
    pub name: String,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub connected: bool,
    pub enabled: bool,
    pub tool_count: usize,
    pub restart_count: u32,
    pub error: Option<String>,
}

type ClientMap = Arc<RwLock<HashMap<String, Arc<McpClient>>>>;

/// Runtime for managing multiple MCP servers
pub struct McpRuntime {
    config: RuntimeConfig,
    supervisor: LifecycleSupervisor,
    ctx: ClientContext,
    clients: ClientMap,
    /// Held while a client is attached to or detached from a process
    attach_lock: Arc<Mutex<()>>,
    reattach_task: JoinHandle<()>,
}

impl McpRuntime {
    /// Must be called inside a Tokio runtime
    pub fn new(config: RuntimeConfig) -> Self {
        let ctx = ClientContext {
            router: Arc::new(NotificationRouter::with_capacity(config.history_capacity)),
            sampling: SamplingManager::with_limits(
                config.max_concurrent_sampling,
                config.sampling_timeout,
            ),
            cancellation: CancellationManager::new(),
            roots: Arc::new(StdRwLock::new(config.roots.clone())),
            client_name: config.client_name.clone(),
            client_version: config.client_version.clone(),
            request_timeout: config.request_timeout,
            sampling_timeout: Some(config.sampling_timeout),
        };
        let clients: ClientMap = Arc::new(RwLock::new(HashMap::new()));

        // Keep cached tool lists current
        let watched = Arc::downgrade(&clients);
        ctx.router
            .on(NotificationType::ToolsListChanged, move |record| {
                let clients = watched.upgrade();
                async move {
                    let Some(clients) = clients else {
                        return Ok(());
                    };
                    let client = clients.read().await.get(&record.server_name).cloned();
                    if let Some(client) = client {
                        let tools = client.list_tools().await?;
                        tracing::info!(server = %record.server_name, tools = tools.len(), "Refreshed MCP tool list");
                    }
                    Ok::<(), McpError>(())
                }
            });

        let supervisor = LifecycleSupervisor::new();
        let attach_lock = Arc::new(Mutex::new(()));
        let reattach_task = tokio::spawn(watch_restarts(
            supervisor.clone(),
            ctx.clone(),
            clients.clone(),
            attach_lock.clone(),
        ));

        Self {
            config,
            supervisor,
            ctx,
            clients,
            attach_lock,
            reattach_task,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(RuntimeConfig::from_file(path)?))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &LifecycleSupervisor {
        &self.supervisor
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.ctx.router
    }

    pub fn sampling(&self) -> &SamplingManager {
        &self.ctx.sampling
    }

    pub fn cancellation(&self) -> &CancellationManager {
        &self.ctx.cancellation
    }

    /// Register every configured server with the supervisor, dependencies included
    pub async fn register_all(&self) -> Result<()> {
        for (name, server) in &self.config.servers {
            self.supervisor.register_server(name, server.clone()).await?;
            self.supervisor
                .set_dependencies(name, server.depends_on.iter().cloned())
                .await?;
        }
        tracing::info!(servers = self.config.servers.len(), "Registered MCP servers");
        Ok(())
    }

    /// Start the server (and its dependencies) and complete the MCP handshake
    pub async fn connect(&self, name: &str) -> Result<()> {
        let _attach = self.attach_lock.lock().await;
        self.connect_locked(name).await
    }

    async fn connect_locked(&self, name: &str) -> Result<()> {
        if let Some(existing) = self.client(name).await {
            if existing.is_connected() {
                return Ok(());
            }
            self.clients.write().await.remove(name);
            let _ = existing.close().await;
        }

        let config = self
            .supervisor
            .config(name)
            .await
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
        if !config.enabled {
            return Err(McpError::Config(format!("MCP server is disabled: {}", name)));
        }

        self.supervisor.start(name, StartOptions::default()).await?;
        let transport = match self.supervisor.take_transport(name).await {
            Ok(t) => t,
            Err(_) => {
                // A previous client owned this child's stdio. A forced start
                // replaces the process without touching the crash restart budget.
                let force = StartOptions {
                    force: true,
                    ..Default::default()
                };
                self.supervisor.start(name, force).await?;
                self.supervisor.take_transport(name).await?
            }
        };

        let client = handshake(name, transport, &self.ctx).await?;
        self.clients.write().await.insert(name.to_string(), client);
        Ok(())
    }

    /// Connect every enabled server; failures are collected, not fatal
    pub async fn connect_all(&self) -> Result<()> {
        let names: Vec<String> = self
            .config
            .servers
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(n, _)| n.clone())
            .collect();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.connect(&name).await {
                tracing::warn!(server = %name, error = %e, "Failed to connect MCP server");
                failures.push(format!("{}: {}", name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(McpError::Aggregate(format!(
                "Failed to connect {} server(s): {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    /// Close the client and stop the process
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let _attach = self.attach_lock.lock().await;
        let client = self.clients.write().await.remove(name);
        if let Some(client) = client {
            client.close().await?;
            tracing::info!(server = %name, "MCP server disconnected");
        }
        self.supervisor.stop(name, StopOptions::default()).await
    }

    /// Apply a changed server config, reconnecting if it was connected
    pub async fn update_server(&self, name: &str, config: ServerConfig) -> Result<()> {
        config.validate(name)?;
        let _attach = self.attach_lock.lock().await;
        let client = self.clients.write().await.remove(name);
        let was_connected = client.is_some();
        if let Some(client) = client {
            let _ = client.close().await;
        }
        self.supervisor.on_config_change(name, config).await?;
        if was_connected {
            self.connect_locked(name).await?;
        }
        Ok(())
    }

    /// Replace the roots answered to `roots/list` and tell connected servers
    pub async fn set_roots(&self, roots: Vec<crate::protocol::types::Root>) {
        *self
            .ctx
            .roots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = roots;
        let clients: Vec<Arc<McpClient>> = self.clients.read().await.values().cloned().collect();
        for client in clients {
            if let Err(e) = client.notify_roots_changed().await {
                tracing::debug!(server = %client.name, error = %e, "Could not send roots/list_changed");
            }
        }
    }

    /// Cancel everything in flight, close every client, stop every process
    pub async fn shutdown(&self) -> Result<()> {
        let cancelled = self
            .ctx
            .cancellation
            .cancel_all(CancellationReason::SystemShutdown);
        self.ctx.sampling.cancel_all();

        {
            let _attach = self.attach_lock.lock().await;
            let clients: Vec<Arc<McpClient>> =
                self.clients.write().await.drain().map(|(_, c)| c).collect();
            for client in clients {
                if let Err(e) = client.close().await {
                    tracing::debug!(server = %client.name, error = %e, "Error closing MCP client");
                }
            }
        }
        tracing::info!(cancelled = cancelled.len(), "MCP runtime shutting down");
        self.supervisor.shutdown().await
    }

    pub async fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.client(name)
            .await
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub async fn list_connected(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every cached tool, named `mcp__<server>__<tool>`
    pub async fn all_tools(&self) -> Vec<(String, McpTool)> {
        let clients = self.clients.read().await;
        let mut all_tools = Vec::new();
        for (server_name, client) in clients.iter() {
            for tool in client.cached_tools() {
                all_tools.push((tool_full_name(server_name, &tool.name), tool));
            }
        }
        all_tools.sort_by(|a, b| a.0.cmp(&b.0));
        all_tools
    }

    /// Call a tool by full name
    pub async fn call_tool(
        &self,
        full_name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let (server_name, tool_name) = parse_tool_name(full_name)?;
        let client = self.client(&server_name).await.ok_or_else(|| {
            McpError::Config(format!("MCP server not connected: {}", server_name))
        })?;
        client.call_tool(&tool_name, arguments, timeout).await
    }

    /// Status of every registered server, in registration order
    pub async fn status(&self) -> Vec<McpServerStatus> {
        let clients = self.clients.read().await;
        let mut out = Vec::new();
        for process in self.supervisor.statuses().await {
            let client = clients.get(&process.name);
            let enabled = self
                .config
                .servers
                .get(&process.name)
                .map_or(true, |s| s.enabled);
            out.push(McpServerStatus {
                connected: client.is_some_and(|c| c.is_connected()),
                tool_count: client.map_or(0, |c| c.cached_tools().len()),
                enabled,
                state: process.state,
                pid: process.pid,
                restart_count: process.restart_count,
                error: process.last_error,
                name: process.name,
            });
        }
        out
    }
}

impl Drop for McpRuntime {
    fn drop(&mut self) {
        self.reattach_task.abort();
    }
}

/// Build a client on a child's stdio and complete the MCP handshake
async fn handshake(
    name: &str,
    transport: StdioTransport,
    ctx: &ClientContext,
) -> Result<Arc<McpClient>> {
    let client = McpClient::new(name, Arc::new(transport), ctx.clone());
    let init = match client.connect().await {
        Ok(init) => init,
        Err(e) => {
            let _ = client.close().await;
            return Err(e);
        }
    };
    let tools = if init.capabilities.tools.is_some() {
        match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = client.close().await;
                return Err(e);
            }
        }
    } else {
        Vec::new()
    };
    tracing::info!(server = %name, tools = tools.len(), "MCP server connected");
    Ok(client)
}

/// Move connected clients onto the new process after a supervisor restart
async fn watch_restarts(
    supervisor: LifecycleSupervisor,
    ctx: ClientContext,
    clients: ClientMap,
    attach_lock: Arc<Mutex<()>>,
) {
    let mut events = supervisor.subscribe();
    loop {
        let servers = match events.recv().await {
            Ok(LifecycleEvent::Started { server, .. }) => vec![server],
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Lifecycle events dropped, rechecking every client");
                clients.read().await.keys().cloned().collect()
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let _attach = attach_lock.lock().await;
        for server in servers {
            reattach(&supervisor, &ctx, &clients, &server).await;
        }
    }
}

/// Only a server that has a client and unclaimed stdio is reattached
async fn reattach(
    supervisor: &LifecycleSupervisor,
    ctx: &ClientContext,
    clients: &ClientMap,
    server: &str,
) {
    let Some(stale) = clients.read().await.get(server).cloned() else {
        return;
    };
    let Ok(transport) = supervisor.take_transport(server).await else {
        return;
    };
    let _ = stale.close().await;

    match handshake(server, transport, ctx).await {
        Ok(client) => {
            tracing::info!(server = %server, "Reattached MCP client to restarted server");
            clients.write().await.insert(server.to_string(), client);
        }
        Err(e) => {
            tracing::warn!(server = %server, error = %e, "Failed to reattach MCP client");
            clients.write().await.remove(server);
        }
    }
}

pub fn tool_full_name(server: &str, tool: &str) -> String {
    format!("{TOOL_PREFIX}{server}{TOOL_SEPARATOR}{tool}")
}

/// Split `mcp__<server>__<tool>` into `(server, tool)`
pub fn parse_tool_name(full_name: &str) -> Result<(String, String)> {
    let rest = full_name
        .strip_prefix(TOOL_PREFIX)
        .ok_or_else(|| McpError::Validation(format!("Invalid MCP tool name: {}", full_name)))?;
    match rest.split_once(TOOL_SEPARATOR) {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => {
            Ok((server.to_string(), tool.to_string()))
        }
        _ => Err(McpError::Validation(format!(
            "Invalid MCP tool name format: {}",
            full_name
        ))),
    }
}
