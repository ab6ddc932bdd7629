use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-server lifecycle state
///
/// `Stopped` and `Error` are terminal until an explicit start. `Crashed` may
/// move back to `Starting` through the auto-restart path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Error,
}

impl ServerState {
    pub fn label(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Crashed => "crashed",
            ServerState::Error => "error",
        }
    }

    /// Whether a live child process belongs to this state
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            ServerState::Starting | ServerState::Running | ServerState::Stopping
        )
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of one supervised server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProcess {
    pub name: String,
    pub pid: Option<u32>,
    pub state: ServerState,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub health_failures: u32,
    pub last_error: Option<String>,
}

impl ServerProcess {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            state: ServerState::Stopped,
            started_at: None,
            stopped_at: None,
            restart_count: 0,
            consecutive_failures: 0,
            health_failures: 0,
            last_error: None,
        }
    }

    /// Seconds since the current process became ready
    pub fn uptime_secs(&self) -> Option<i64> {
        match self.state {
            ServerState::Running => self
                .started_at
                .map(|since| (Utc::now() - since).num_seconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_all_variants() {
        assert_eq!(ServerState::Stopped.label(), "stopped");
        assert_eq!(ServerState::Starting.label(), "starting");
        assert_eq!(ServerState::Running.label(), "running");
        assert_eq!(ServerState::Stopping.label(), "stopping");
        assert_eq!(ServerState::Crashed.label(), "crashed");
        assert_eq!(ServerState::Error.to_string(), "error");
    }

    #[test]
    fn test_has_process() {
        assert!(ServerState::Running.has_process());
        assert!(ServerState::Stopping.has_process());
        assert!(!ServerState::Crashed.has_process());
        assert!(!ServerState::Stopped.has_process());
    }

    #[test]
    fn test_new_process_is_stopped() {
        let p = ServerProcess::new("fs");
        assert_eq!(p.state, ServerState::Stopped);
        assert_eq!(p.restart_count, 0);
        assert!(p.uptime_secs().is_none());
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(ServerProcess::new("fs")).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["restartCount"], 0);
    }
}
