//! MCP server process supervision
//!
//! One state machine per named server: spawn, readiness grace window, health
//! checks, exponential-backoff auto-restart, dependency-ordered start/stop and
//! graceful-then-forced shutdown. The supervisor is the only writer of
//! [`ServerProcess::state`].

mod graph;
mod health;
mod spawn;
mod state;

pub use graph::{dependency_chain, DependencyGraph};
pub use health::{HealthProbe, HealthTracker, HealthVerdict, ProcessProbe, HEALTH_FAILURE_THRESHOLD};
pub use spawn::ExitInfo;
pub use state::{ServerProcess, ServerState};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::{McpError, Result};
use crate::transport::StdioTransport;

use spawn::spawn_process;

/// Poll interval while waiting for another caller's start or stop to settle
const SETTLE_POLL: Duration = Duration::from_millis(100);

/// Stdout lines buffered for the transport before the pump applies backpressure
const STDOUT_BUFFER: usize = 256;

pub const REASON_MAX_RESTARTS_EXCEEDED: &str = "max_restarts_exceeded";
pub const REASON_HEALTH_CHECK_FAILED: &str = "health_check_failed";

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Starting {
        server: String,
    },
    Started {
        server: String,
        pid: Option<u32>,
    },
    Stopping {
        server: String,
    },
    Stopped {
        server: String,
        exit_code: Option<i32>,
    },
    Error {
        server: String,
        error: String,
    },
    Crashed {
        server: String,
        reason: String,
        exit_code: Option<i32>,
    },
    Restarting {
        server: String,
        attempt: u32,
        delay: Duration,
    },
    HealthOk {
        server: String,
    },
    HealthFailed {
        server: String,
        failures: u32,
    },
    HealthDegraded {
        server: String,
        failures: u32,
    },
    ConfigChanged {
        server: String,
    },
    Stdout {
        server: String,
        line: String,
    },
    Stderr {
        server: String,
        line: String,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Starting { .. } => "server:starting",
            LifecycleEvent::Started { .. } => "server:started",
            LifecycleEvent::Stopping { .. } => "server:stopping",
            LifecycleEvent::Stopped { .. } => "server:stopped",
            LifecycleEvent::Error { .. } => "server:error",
            LifecycleEvent::Crashed { .. } => "server:crashed",
            LifecycleEvent::Restarting { .. } => "server:restarting",
            LifecycleEvent::HealthOk { .. } => "health:ok",
            LifecycleEvent::HealthFailed { .. } => "health:failed",
            LifecycleEvent::HealthDegraded { .. } => "health:degraded",
            LifecycleEvent::ConfigChanged { .. } => "config:changed",
            LifecycleEvent::Stdout { .. } => "server:stdout",
            LifecycleEvent::Stderr { .. } => "server:stderr",
        }
    }

    pub fn server(&self) -> &str {
        match self {
            LifecycleEvent::Starting { server }
            | LifecycleEvent::Started { server, .. }
            | LifecycleEvent::Stopping { server }
            | LifecycleEvent::Stopped { server, .. }
            | LifecycleEvent::Error { server, .. }
            | LifecycleEvent::Crashed { server, .. }
            | LifecycleEvent::Restarting { server, .. }
            | LifecycleEvent::HealthOk { server }
            | LifecycleEvent::HealthFailed { server, .. }
            | LifecycleEvent::HealthDegraded { server, .. }
            | LifecycleEvent::ConfigChanged { server }
            | LifecycleEvent::Stdout { server, .. }
            | LifecycleEvent::Stderr { server, .. } => server,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Restart even if already running
    pub force: bool,
    /// Bound on waiting for a concurrent start; defaults to the startup timeout
    pub wait_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Send `SIGKILL` instead of the configured kill signal
    pub force: bool,
}

struct ChildControl {
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

struct StdioParts {
    stdin: ChildStdin,
    lines: mpsc::Receiver<String>,
}

struct ServerEntry {
    config: ServerConfig,
    dependencies: Vec<String>,
    process: ServerProcess,
    /// Bumped on every spawn so exits of older children are ignored
    generation: u64,
    control: Option<ChildControl>,
    stdio: Option<StdioParts>,
    health_task: Option<JoinHandle<()>>,
    restart_task: Option<JoinHandle<()>>,
}

impl ServerEntry {
    fn new(name: &str, config: ServerConfig) -> Self {
        Self {
            dependencies: config.depends_on.clone(),
            config,
            process: ServerProcess::new(name),
            generation: 0,
            control: None,
            stdio: None,
            health_task: None,
            restart_task: None,
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
    }

    fn mark_stopped(&mut self) {
        self.process.state = ServerState::Stopped;
        self.process.pid = None;
        self.process.stopped_at = Some(Utc::now());
        self.control = None;
        self.stdio = None;
    }
}

struct Inner {
    servers: RwLock<IndexMap<String, ServerEntry>>,
    events: broadcast::Sender<LifecycleEvent>,
    probe: Arc<dyn HealthProbe>,
}

/// Supervises every registered MCP server process
#[derive(Clone)]
pub struct LifecycleSupervisor {
    inner: Arc<Inner>,
}

impl LifecycleSupervisor {
    pub fn new() -> Self {
        Self::with_probe(Arc::new(ProcessProbe))
    }

    pub fn with_probe(probe: Arc<dyn HealthProbe>) -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            inner: Arc::new(Inner {
                servers: RwLock::new(IndexMap::new()),
                events,
                probe,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.inner.events.send(event);
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register or replace a server's configuration
    ///
    /// The config is validated; dependencies are taken from
    /// `config.depends_on` and resolved only at start.
    pub async fn register_server(&self, name: &str, config: ServerConfig) -> Result<()> {
        config.validate(name)?;
        let mut servers = self.inner.servers.write().await;
        match servers.get_mut(name) {
            Some(entry) => {
                entry.dependencies = config.depends_on.clone();
                entry.config = config;
                tracing::debug!(server = %name, "Updated MCP server registration");
            }
            None => {
                servers.insert(name.to_string(), ServerEntry::new(name, config));
                tracing::info!(server = %name, "Registered MCP server");
            }
        }
        Ok(())
    }

    /// Stop (if needed) and forget a server
    pub async fn unregister_server(&self, name: &str) -> Result<()> {
        self.stop(name, StopOptions::default()).await?;
        if let Some(mut entry) = self.inner.servers.write().await.shift_remove(name) {
            entry.abort_tasks();
        }
        tracing::info!(server = %name, "Unregistered MCP server");
        Ok(())
    }

    pub async fn set_dependencies<I, S>(&self, name: &str, deps: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut servers = self.inner.servers.write().await;
        let entry = servers
            .get_mut(name)
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
        entry.dependencies = deps.into_iter().map(Into::into).collect();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn status(&self, name: &str) -> Option<ServerProcess> {
        self.inner
            .servers
            .read()
            .await
            .get(name)
            .map(|e| e.process.clone())
    }

    pub async fn statuses(&self) -> Vec<ServerProcess> {
        self.inner
            .servers
            .read()
            .await
            .values()
            .map(|e| e.process.clone())
            .collect()
    }

    pub async fn state(&self, name: &str) -> Option<ServerState> {
        self.inner
            .servers
            .read()
            .await
            .get(name)
            .map(|e| e.process.state)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.state(name).await == Some(ServerState::Running)
    }

    pub async fn config(&self, name: &str) -> Option<ServerConfig> {
        self.inner
            .servers
            .read()
            .await
            .get(name)
            .map(|e| e.config.clone())
    }

    pub async fn dependencies(&self, name: &str) -> Option<Vec<String>> {
        self.inner
            .servers
            .read()
            .await
            .get(name)
            .map(|e| e.dependencies.clone())
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.inner.servers.read().await.keys().cloned().collect()
    }

    /// Hand the running child's stdio to a transport; once per spawn
    pub async fn take_transport(&self, name: &str) -> Result<StdioTransport> {
        let mut servers = self.inner.servers.write().await;
        let entry = servers
            .get_mut(name)
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
        let parts = entry.stdio.take().ok_or_else(|| {
            McpError::process(name, "no stdio available (not running or already taken)")
        })?;
        Ok(StdioTransport::new(name, parts.stdin, parts.lines))
    }

    // ------------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------------

    /// Start a server after its declared dependencies
    pub async fn start(&self, name: &str, opts: StartOptions) -> Result<()> {
        let chain = {
            let servers = self.inner.servers.read().await;
            if !servers.contains_key(name) {
                return Err(McpError::UnknownServer(name.to_string()));
            }
            let deps: HashMap<String, Vec<String>> = servers
                .iter()
                .map(|(n, e)| (n.clone(), e.dependencies.clone()))
                .collect();
            dependency_chain(name, &deps)?
        };

        for dep in &chain {
            if !self.is_running(dep).await {
                tracing::info!(server = %name, dependency = %dep, "Starting dependency");
                self.start_one(dep, StartOptions::default()).await?;
            }
        }
        self.start_one(name, opts).await
    }

    /// Depth-first start of every not-yet-running dependency, then `name`
    pub async fn start_with_dependencies(&self, name: &str) -> Result<()> {
        self.start(name, StartOptions::default()).await
    }

    async fn start_one(&self, name: &str, opts: StartOptions) -> Result<()> {
        let mut force = opts.force;
        let (generation, config) = loop {
            let mut servers = self.inner.servers.write().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
            let wait = opts.wait_timeout.unwrap_or(entry.config.startup_timeout);

            match entry.process.state {
                ServerState::Running if !force => return Ok(()),
                ServerState::Running => {
                    drop(servers);
                    self.stop(name, StopOptions::default()).await?;
                    force = false;
                }
                ServerState::Starting => {
                    drop(servers);
                    let settled = self.wait_for_settled(name, wait).await?;
                    return match settled {
                        ServerState::Running => Ok(()),
                        other => Err(McpError::process(
                            name,
                            format!("concurrent start ended in state '{other}'"),
                        )),
                    };
                }
                ServerState::Stopping => {
                    drop(servers);
                    self.wait_for_settled(name, wait).await?;
                }
                ServerState::Stopped | ServerState::Crashed | ServerState::Error => {
                    entry.process.state = ServerState::Starting;
                    entry.generation += 1;
                    break (entry.generation, entry.config.clone());
                }
            }
        };

        self.emit(LifecycleEvent::Starting {
            server: name.to_string(),
        });
        tracing::info!(server = %name, command = %config.command, "Starting MCP server");

        let spawned = match spawn_process(name, &config) {
            Ok(spawned) => spawned,
            Err(e) => return Err(self.fail_start(name, generation, e).await),
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (lines_tx, lines_rx) = mpsc::channel(STDOUT_BUFFER);
        let pid = spawned.pid;

        self.spawn_monitor(name, generation, spawned.child, kill_rx, exit_tx);
        self.spawn_stdout_pump(name, spawned.stdout, lines_tx);
        self.spawn_stderr_pump(name, spawned.stderr);

        {
            let mut servers = self.inner.servers.write().await;
            match servers.get_mut(name) {
                Some(entry) if entry.generation == generation => {
                    entry.process.pid = pid;
                    entry.control = Some(ChildControl {
                        pid,
                        kill_tx: kill_tx.clone(),
                        exit_rx: exit_rx.clone(),
                    });
                    entry.stdio = Some(StdioParts {
                        stdin: spawned.stdin,
                        lines: lines_rx,
                    });
                }
                _ => {
                    let _ = kill_tx.send(());
                    return Err(McpError::process(name, "unregistered during startup"));
                }
            }
        }

        let mut exit_watch = exit_rx;
        let ready = tokio::time::timeout(config.startup_timeout, async {
            tokio::select! {
                exit = exit_watch.wait_for(|e| e.is_some()) => Err(exit.ok().and_then(|e| *e)),
                _ = tokio::time::sleep(config.ready_grace) => Ok(()),
            }
        })
        .await;

        match ready {
            Ok(Ok(())) => {}
            Ok(Err(exit)) => {
                let detail = exit.map_or_else(|| "exited".to_string(), |e| e.describe());
                let err = McpError::process(name, format!("{detail} during startup"));
                return Err(self.fail_start(name, generation, err).await);
            }
            Err(_) => {
                let _ = kill_tx.send(());
                let err = McpError::Timeout(format!(
                    "server '{}' not ready within {}ms",
                    name,
                    config.startup_timeout.as_millis()
                ));
                return Err(self.fail_start(name, generation, err).await);
            }
        }

        {
            let mut servers = self.inner.servers.write().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
            if entry.generation != generation || entry.process.state != ServerState::Starting {
                return Err(McpError::process(name, "start interrupted"));
            }
            entry.process.state = ServerState::Running;
            entry.process.started_at = Some(Utc::now());
            entry.process.stopped_at = None;
            entry.process.consecutive_failures = 0;
            entry.process.health_failures = 0;
            entry.process.last_error = None;
            entry.health_task = Some(self.spawn_health_check(
                name,
                generation,
                config.health_check_interval,
            ));
        }

        tracing::info!(server = %name, pid = ?pid, "MCP server running");
        self.emit(LifecycleEvent::Started {
            server: name.to_string(),
            pid,
        });
        Ok(())
    }

    /// Record a failed start and hand back the error for the caller
    ///
    /// Only a start still in `Starting` is a failure. If a stop took over, the
    /// exit belongs to it: no `Error` event, no failure counted, and the caller
    /// gets `Cancelled`.
    async fn fail_start(&self, name: &str, generation: u64, err: McpError) -> McpError {
        {
            let mut servers = self.inner.servers.write().await;
            match servers.get_mut(name) {
                Some(entry)
                    if entry.generation == generation
                        && entry.process.state == ServerState::Starting =>
                {
                    entry.process.state = ServerState::Error;
                    entry.process.pid = None;
                    entry.process.consecutive_failures += 1;
                    entry.process.last_error = Some(err.to_string());
                    entry.control = None;
                    entry.stdio = None;
                }
                _ => {
                    tracing::debug!(server = %name, error = %err, "Start superseded by stop");
                    return McpError::Cancelled {
                        reason: format!("server '{name}' stopped during startup"),
                    };
                }
            }
        }
        tracing::error!(server = %name, error = %err, "MCP server failed to start");
        self.emit(LifecycleEvent::Error {
            server: name.to_string(),
            error: err.to_string(),
        });
        err
    }

    /// Poll until the server leaves `Starting`/`Stopping`
    async fn wait_for_settled(&self, name: &str, limit: Duration) -> Result<ServerState> {
        let deadline = Instant::now() + limit;
        loop {
            let state = self
                .state(name)
                .await
                .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
            if !matches!(state, ServerState::Starting | ServerState::Stopping) {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                return Err(McpError::Timeout(format!(
                    "server '{}' still {} after {}ms",
                    name,
                    state,
                    limit.as_millis()
                )));
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    // ------------------------------------------------------------------------
    // Stop / restart
    // ------------------------------------------------------------------------

    /// Signal the child and wait for it to exit, escalating to `SIGKILL`
    /// after the shutdown timeout
    pub async fn stop(&self, name: &str, opts: StopOptions) -> Result<()> {
        let (control, config) = loop {
            let mut servers = self.inner.servers.write().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
            let wait = entry.config.shutdown_timeout + entry.config.startup_timeout;

            match (entry.process.state, entry.control.is_some()) {
                (ServerState::Stopped, _) => {
                    entry.abort_tasks();
                    return Ok(());
                }
                (ServerState::Stopping, _) | (ServerState::Starting, false) => {
                    drop(servers);
                    self.wait_for_settled(name, wait).await?;
                }
                (ServerState::Crashed | ServerState::Error, false) => {
                    entry.abort_tasks();
                    entry.mark_stopped();
                    drop(servers);
                    self.emit(LifecycleEvent::Stopped {
                        server: name.to_string(),
                        exit_code: None,
                    });
                    return Ok(());
                }
                _ => {
                    entry.abort_tasks();
                    entry.stdio = None;
                    match entry.control.take() {
                        Some(control) => {
                            entry.process.state = ServerState::Stopping;
                            break (control, entry.config.clone());
                        }
                        None => {
                            entry.mark_stopped();
                            drop(servers);
                            self.emit(LifecycleEvent::Stopped {
                                server: name.to_string(),
                                exit_code: None,
                            });
                            return Ok(());
                        }
                    }
                }
            }
        };

        self.emit(LifecycleEvent::Stopping {
            server: name.to_string(),
        });
        let signal = if opts.force {
            "SIGKILL"
        } else {
            config.kill_signal.as_str()
        };
        tracing::info!(server = %name, signal = %signal, "Stopping MCP server");
        self.deliver_signal(name, &control, signal);

        let mut exit_rx = control.exit_rx.clone();
        let exit = match wait_exit(&mut exit_rx, config.shutdown_timeout).await {
            Some(exit) => exit,
            None => {
                tracing::warn!(
                    server = %name,
                    timeout_ms = config.shutdown_timeout.as_millis() as u64,
                    "MCP server ignored shutdown signal, killing"
                );
                let _ = control.kill_tx.send(());
                match wait_exit(&mut exit_rx, config.shutdown_timeout).await {
                    Some(exit) => exit,
                    None => {
                        let err = McpError::Timeout(format!(
                            "server '{name}' did not exit after SIGKILL"
                        ));
                        let mut servers = self.inner.servers.write().await;
                        if let Some(entry) = servers.get_mut(name) {
                            entry.process.state = ServerState::Error;
                            entry.process.last_error = Some(err.to_string());
                            entry.control = Some(control);
                        }
                        drop(servers);
                        self.emit(LifecycleEvent::Error {
                            server: name.to_string(),
                            error: err.to_string(),
                        });
                        return Err(err);
                    }
                }
            }
        };

        if let Some(entry) = self.inner.servers.write().await.get_mut(name) {
            entry.mark_stopped();
        }
        let exit_code = exit.and_then(|e| e.code);
        tracing::info!(server = %name, exit_code = ?exit_code, "MCP server stopped");
        self.emit(LifecycleEvent::Stopped {
            server: name.to_string(),
            exit_code,
        });
        Ok(())
    }

    fn deliver_signal(&self, name: &str, control: &ChildControl, signal: &str) {
        if signal != "SIGKILL" && spawn::try_signal(name, control.pid, signal) {
            return;
        }
        let _ = control.kill_tx.send(());
    }

    /// Stop if running, bump `restart_count`, back off, then start
    pub async fn restart(&self, name: &str) -> Result<()> {
        let state = self
            .state(name)
            .await
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
        if matches!(state, ServerState::Running | ServerState::Starting) {
            self.stop(name, StopOptions::default()).await?;
        }
        self.restart_after_backoff(name).await
    }

    async fn restart_after_backoff(&self, name: &str) -> Result<()> {
        let (attempt, delay) = {
            let mut servers = self.inner.servers.write().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
            entry.process.restart_count += 1;
            let attempt = entry.process.restart_count;
            (attempt, entry.config.restart.backoff(attempt))
        };

        tracing::info!(
            server = %name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Restarting MCP server"
        );
        self.emit(LifecycleEvent::Restarting {
            server: name.to_string(),
            attempt,
            delay,
        });
        tokio::time::sleep(delay).await;
        self.start(name, StartOptions::default()).await
    }

    /// Decide between another automatic attempt and giving up
    ///
    /// Called with the write lock held on a `Crashed` or `Error` entry.
    fn schedule_recovery(&self, name: &str, entry: &mut ServerEntry) {
        let policy = &entry.config.restart;
        if !policy.auto_restart {
            tracing::warn!(server = %name, state = %entry.process.state, "Auto-restart disabled");
            return;
        }

        let process = &entry.process;
        if process.restart_count < policy.max_restarts
            && process.consecutive_failures < policy.max_consecutive_failures
        {
            let supervisor = self.clone();
            let name = name.to_string();
            entry.restart_task = Some(tokio::spawn(supervisor.run_auto_restart(name)));
            return;
        }

        tracing::error!(
            server = %name,
            restart_count = process.restart_count,
            consecutive_failures = process.consecutive_failures,
            "MCP server exceeded its restart budget, giving up"
        );
        entry.process.state = ServerState::Crashed;
        entry.process.pid = None;
        entry.process.stopped_at = Some(Utc::now());
        entry.process.last_error = Some(REASON_MAX_RESTARTS_EXCEEDED.to_string());
        entry.control = None;
        entry.stdio = None;
        self.emit(LifecycleEvent::Crashed {
            server: name.to_string(),
            reason: REASON_MAX_RESTARTS_EXCEEDED.to_string(),
            exit_code: None,
        });
    }

    async fn run_auto_restart(self, name: String) {
        if let Err(e) = self.restart_after_backoff(&name).await {
            tracing::warn!(server = %name, error = %e, "Automatic restart failed");
            let mut servers = self.inner.servers.write().await;
            if let Some(entry) = servers.get_mut(&name) {
                if matches!(
                    entry.process.state,
                    ServerState::Error | ServerState::Crashed
                ) {
                    self.schedule_recovery(&name, entry);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Batch operations
    // ------------------------------------------------------------------------

    async fn dependency_graph(&self) -> Result<DependencyGraph> {
        let servers = self.inner.servers.read().await;
        DependencyGraph::build(
            servers
                .iter()
                .map(|(n, e)| (n.as_str(), e.dependencies.as_slice())),
        )
    }

    /// Start every enabled server in dependency order
    ///
    /// Failures are collected into one `Aggregate` error, or only logged when
    /// `force` is set.
    pub async fn start_all(&self, force: bool) -> Result<()> {
        let graph = self.dependency_graph().await?;
        let mut failures = Vec::new();
        for name in graph.start_order() {
            if !self.config(name).await.is_some_and(|c| c.enabled) {
                tracing::debug!(server = %name, "Skipping disabled MCP server");
                continue;
            }
            if let Err(e) = self.start(name, StartOptions::default()).await {
                failures.push(format!("{name}: {e}"));
            }
        }
        finish_batch("start", failures, force)
    }

    /// Stop every server in reverse dependency order
    pub async fn stop_all(&self, force: bool) -> Result<()> {
        let graph = self.dependency_graph().await?;
        let mut failures = Vec::new();
        for name in graph.stop_order() {
            if let Err(e) = self.stop(name, StopOptions::default()).await {
                failures.push(format!("{name}: {e}"));
            }
        }
        finish_batch("stop", failures, force)
    }

    pub async fn restart_all(&self, force: bool) -> Result<()> {
        let graph = self.dependency_graph().await?;
        let mut failures = Vec::new();
        for name in graph.start_order() {
            if !self.config(name).await.is_some_and(|c| c.enabled) {
                continue;
            }
            if let Err(e) = self.restart(name).await {
                failures.push(format!("{name}: {e}"));
            }
        }
        finish_batch("restart", failures, force)
    }

    /// Stop if running, swap the configuration, start again if it was running
    pub async fn on_config_change(&self, name: &str, config: ServerConfig) -> Result<()> {
        let state = self
            .state(name)
            .await
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
        let was_running = matches!(state, ServerState::Running | ServerState::Starting);
        if was_running {
            self.stop(name, StopOptions::default()).await?;
        }

        if let Some(entry) = self.inner.servers.write().await.get_mut(name) {
            entry.dependencies = config.depends_on.clone();
            entry.config = config;
        }
        tracing::info!(server = %name, "MCP server configuration changed");
        self.emit(LifecycleEvent::ConfigChanged {
            server: name.to_string(),
        });

        if was_running {
            self.start(name, StartOptions::default()).await?;
        }
        Ok(())
    }

    /// Stop everything and clear every background task
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.stop_all(true).await;
        for entry in self.inner.servers.write().await.values_mut() {
            entry.abort_tasks();
        }
        result
    }

    // ------------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------------

    /// Owns the child: waits for exit or a kill request, then reports the exit
    fn spawn_monitor(
        &self,
        name: &str,
        generation: u64,
        mut child: Child,
        mut kill_rx: mpsc::UnboundedReceiver<()>,
        exit_tx: watch::Sender<Option<ExitInfo>>,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ExitInfo::from_status(&status),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "Failed to reap MCP server");
                    ExitInfo::default()
                }
            };
            tracing::debug!(server = %name, exit = %exit.describe(), "MCP server process exited");
            exit_tx.send_replace(Some(exit));
            if let Some(supervisor) = Self::upgrade(&weak) {
                supervisor.on_exit(&name, generation, exit).await;
            }
        });
    }

    /// Unexpected exits only; starts and stops handle their own
    async fn on_exit(&self, name: &str, generation: u64, exit: ExitInfo) {
        let mut servers = self.inner.servers.write().await;
        let Some(entry) = servers.get_mut(name) else {
            return;
        };
        if entry.generation != generation {
            tracing::debug!(server = %name, "Ignoring exit of a previous process");
            return;
        }
        if entry.process.state != ServerState::Running {
            return;
        }

        if let Some(task) = entry.health_task.take() {
            task.abort();
        }
        entry.control = None;
        entry.stdio = None;
        entry.process.pid = None;
        entry.process.state = ServerState::Crashed;
        entry.process.stopped_at = Some(Utc::now());
        entry.process.consecutive_failures += 1;
        entry.process.last_error = Some(exit.describe());

        tracing::warn!(server = %name, exit = %exit.describe(), "MCP server crashed");
        self.emit(LifecycleEvent::Crashed {
            server: name.to_string(),
            reason: exit.describe(),
            exit_code: exit.code,
        });
        self.schedule_recovery(name, entry);
    }

    fn spawn_health_check(&self, name: &str, generation: u64, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut tracker = HealthTracker::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(supervisor) = Self::upgrade(&weak) else {
                    break;
                };
                let pid = {
                    let servers = supervisor.inner.servers.read().await;
                    match servers.get(&name) {
                        Some(e)
                            if e.generation == generation
                                && e.process.state == ServerState::Running =>
                        {
                            e.process.pid
                        }
                        _ => break,
                    }
                };

                let healthy = supervisor.inner.probe.check(&name, pid).await;
                let verdict = tracker.record(healthy);
                if let Some(entry) = supervisor.inner.servers.write().await.get_mut(&name) {
                    if entry.generation == generation {
                        entry.process.health_failures = tracker.failures();
                    }
                }

                match verdict {
                    HealthVerdict::Ok => supervisor.emit(LifecycleEvent::HealthOk {
                        server: name.clone(),
                    }),
                    HealthVerdict::Failed(failures) => {
                        tracing::warn!(server = %name, failures, "MCP server health check failed");
                        supervisor.emit(LifecycleEvent::HealthFailed {
                            server: name.clone(),
                            failures,
                        });
                    }
                    HealthVerdict::Degraded(failures) => {
                        tracing::error!(server = %name, failures, "MCP server degraded");
                        supervisor.emit(LifecycleEvent::HealthFailed {
                            server: name.clone(),
                            failures,
                        });
                        supervisor.emit(LifecycleEvent::HealthDegraded {
                            server: name.clone(),
                            failures,
                        });
                        tokio::spawn(supervisor.recover_unhealthy(name, generation));
                        break;
                    }
                }
            }
        })
    }

    /// Kill a degraded server and hand it to the auto-restart path
    async fn recover_unhealthy(self, name: String, generation: u64) {
        match self.inner.servers.read().await.get(&name) {
            Some(e) if e.generation == generation && e.process.state == ServerState::Running => {}
            _ => return,
        }
        if let Err(e) = self.stop(&name, StopOptions { force: true }).await {
            tracing::warn!(server = %name, error = %e, "Failed to stop degraded MCP server");
            return;
        }

        let mut servers = self.inner.servers.write().await;
        let Some(entry) = servers.get_mut(&name) else {
            return;
        };
        if entry.process.state != ServerState::Stopped {
            return;
        }
        entry.process.state = ServerState::Crashed;
        entry.process.consecutive_failures += 1;
        entry.process.last_error = Some(format!(
            "{} consecutive health check failures",
            HEALTH_FAILURE_THRESHOLD
        ));
        self.emit(LifecycleEvent::Crashed {
            server: name.clone(),
            reason: REASON_HEALTH_CHECK_FAILED.to_string(),
            exit_code: None,
        });
        self.schedule_recovery(&name, entry);
    }

    /// Surfaces stdout lines as events and relays them to the transport
    fn spawn_stdout_pump(&self, name: &str, stdout: ChildStdout, lines_tx: mpsc::Sender<String>) {
        let events = self.inner.events.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut relay = Some(lines_tx);
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = events.send(LifecycleEvent::Stdout {
                    server: name.clone(),
                    line: line.clone(),
                });
                if let Some(tx) = &relay {
                    if tx.send(line).await.is_err() {
                        relay = None;
                    }
                }
            }
        });
    }

    fn spawn_stderr_pump(&self, name: &str, stderr: ChildStderr) {
        let events = self.inner.events.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %name, "{}", line);
                let _ = events.send(LifecycleEvent::Stderr {
                    server: name.clone(),
                    line,
                });
            }
        });
    }
}

impl Default for LifecycleSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// `None` on timeout; `Some(None)` if the monitor went away without a status
async fn wait_exit(
    rx: &mut watch::Receiver<Option<ExitInfo>>,
    limit: Duration,
) -> Option<Option<ExitInfo>> {
    match tokio::time::timeout(limit, rx.wait_for(|e| e.is_some())).await {
        Ok(Ok(exit)) => Some(*exit),
        Ok(Err(_)) => Some(None),
        Err(_) => None,
    }
}

fn finish_batch(op: &str, failures: Vec<String>, force: bool) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let message = format!(
        "Failed to {} {} server(s): {}",
        op,
        failures.len(),
        failures.join("; ")
    );
    if force {
        tracing::warn!("{}", message);
        Ok(())
    } else {
        Err(McpError::Aggregate(message))
    }
}
