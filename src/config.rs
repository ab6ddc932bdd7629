//! Runtime and server configuration
//!
//! Servers are declared under the `mcpServers` key:
//!
//! ```json
//! {
//!   "requestTimeout": "30s",
//!   "mcpServers": {
//!     "fs": { "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem", "."] },
//!     "git": { "command": "mcp-git", "dependsOn": ["fs"], "restart": { "maxRestarts": 5 } }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{McpError, Result};
use crate::protocol::types::Root;

/// How a server is brought back after it dies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartPolicy {
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub max_consecutive_failures: u32,
    /// Base delay; doubled per restart up to [`MAX_RESTART_DELAY`]
    #[serde(with = "duration_serde")]
    pub restart_delay: Duration,
}

/// Ceiling for the exponential restart backoff
pub const MAX_RESTART_DELAY: Duration = Duration::from_millis(60_000);

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_restarts: 3,
            max_consecutive_failures: 5,
            restart_delay: Duration::from_secs(1),
        }
    }
}

impl RestartPolicy {
    /// `min(restart_delay * 2^(restart_count - 1), 60s)`
    pub fn backoff(&self, restart_count: u32) -> Duration {
        let exp = restart_count.saturating_sub(1).min(31);
        let base = self.restart_delay.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << exp);
        Duration::from_millis(delay).min(MAX_RESTART_DELAY)
    }
}

/// One MCP server process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Merged over the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_startup_timeout", with = "duration_serde")]
    pub startup_timeout: Duration,
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_health_interval", with = "duration_serde")]
    pub health_check_interval: Duration,
    /// How long the child must stay alive before it counts as ready
    #[serde(default = "default_ready_grace", with = "duration_serde")]
    pub ready_grace: Duration,
    #[serde(default = "default_kill_signal")]
    pub kill_signal: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_ready_grace() -> Duration {
    Duration::from_secs(1)
}
fn default_kill_signal() -> String {
    "SIGTERM".into()
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            enabled: true,
            restart: RestartPolicy::default(),
            startup_timeout: default_startup_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            health_check_interval: default_health_interval(),
            ready_grace: default_ready_grace(),
            kill_signal: default_kill_signal(),
            depends_on: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn ready_grace(mut self, grace: Duration) -> Self {
        self.ready_grace = grace;
        self
    }

    pub fn kill_signal(mut self, signal: impl Into<String>) -> Self {
        self.kill_signal = signal.into();
        self
    }

    pub fn depends_on<I: IntoIterator<Item = S>, S: Into<String>>(mut self, deps: I) -> Self {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(McpError::Config(format!("server '{name}' has an empty command")));
        }
        if self.startup_timeout.is_zero() || self.shutdown_timeout.is_zero() {
            return Err(McpError::Config(format!(
                "server '{name}' startup and shutdown timeouts must be non-zero"
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(McpError::Config(format!(
                "server '{name}' health check interval must be non-zero"
            )));
        }
        if self.depends_on.iter().any(|d| d == name) {
            return Err(McpError::Config(format!("server '{name}' depends on itself")));
        }
        Ok(())
    }
}

/// Whole-runtime settings plus the server table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_max_concurrent_sampling")]
    pub max_concurrent_sampling: usize,
    #[serde(default = "default_sampling_timeout", with = "duration_serde")]
    pub sampling_timeout: Duration,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Answered to servers that call `roots/list`
    #[serde(default)]
    pub roots: Vec<Root>,
    #[serde(default, rename = "mcpServers")]
    pub servers: IndexMap<String, ServerConfig>,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_history_capacity() -> usize {
    100
}
fn default_max_concurrent_sampling() -> usize {
    5
}
fn default_sampling_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").into()
}
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            history_capacity: default_history_capacity(),
            max_concurrent_sampling: default_max_concurrent_sampling(),
            sampling_timeout: default_sampling_timeout(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            log_level: default_log_level(),
            roots: Vec::new(),
            servers: IndexMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| McpError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg = Self::from_json(&src)
            .map_err(|e| McpError::Config(format!("{} in {}", e, path.display())))?;
        Ok(cfg)
    }

    pub fn from_json(src: &str) -> Result<Self> {
        let cfg: RuntimeConfig =
            serde_json::from_str(src).map_err(|e| McpError::Config(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_server(mut self, name: impl Into<String>, server: ServerConfig) -> Self {
        self.servers.insert(name.into(), server);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() || self.sampling_timeout.is_zero() {
            return Err(McpError::Config(
                "request and sampling timeouts must be non-zero".into(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(McpError::Config("history capacity must be at least 1".into()));
        }
        for (name, server) in &self.servers {
            if name.contains("__") {
                return Err(McpError::Config(format!(
                    "server name '{name}' must not contain '__'"
                )));
            }
            server.validate(name)?;
            for dep in &server.depends_on {
                if !self.servers.contains_key(dep) {
                    return Err(McpError::Config(format!(
                        "server '{name}' depends on unknown server '{dep}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Durations as `"500ms"`, `"2s"`, `"1m"` or a bare integer of milliseconds
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("'{s}': {e}"));
        if let Some(v) = s.strip_suffix("ms") {
            return parse(v).map(Duration::from_millis);
        }
        if let Some(v) = s.strip_suffix('s') {
            return parse(v).map(Duration::from_secs);
        }
        if let Some(v) = s.strip_suffix('m') {
            return parse(v).map(|m| Duration::from_secs(m * 60));
        }
        if let Ok(ms) = s.parse::<u64>() {
            return Ok(Duration::from_millis(ms));
        }
        Err(format!(
            "unknown duration format: '{s}' (use '500ms', '2s' or '1m')"
        ))
    }
}
