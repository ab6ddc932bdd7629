use async_trait::async_trait;

use super::spawn::pid_alive;

/// Consecutive failed checks before a server is declared degraded
pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `pid` is the supervised child's pid, if the platform reported one
    async fn check(&self, server: &str, pid: Option<u32>) -> bool;
}

/// Asserts the process handle is still alive
pub struct ProcessProbe;

#[async_trait]
impl HealthProbe for ProcessProbe {
    async fn check(&self, _server: &str, pid: Option<u32>) -> bool {
        pid.is_some_and(pid_alive)
    }
}

/// Tracks consecutive failures for one server
#[derive(Debug, Default, Clone, Copy)]
pub struct HealthTracker {
    failures: u32,
}

/// What a single check result means for the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Ok,
    Failed(u32),
    Degraded(u32),
}

impl HealthTracker {
    pub fn record(&mut self, healthy: bool) -> HealthVerdict {
        if healthy {
            self.failures = 0;
            return HealthVerdict::Ok;
        }
        self.failures += 1;
        if self.failures >= HEALTH_FAILURE_THRESHOLD {
            HealthVerdict::Degraded(self.failures)
        } else {
            HealthVerdict::Failed(self.failures)
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
