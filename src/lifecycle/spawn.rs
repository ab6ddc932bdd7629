use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::ServerConfig;
use crate::error::{McpError, Result};

#[derive(Debug)]
pub struct SpawnResult {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn a server with three piped stdio streams
///
/// `env` is merged over the inherited environment.
pub fn spawn_process(name: &str, config: &ServerConfig) -> Result<SpawnResult> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| McpError::process(name, format!("failed to spawn '{}': {e}", config.command)))?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| McpError::process(name, "child stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| McpError::process(name, "child stdout unavailable"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| McpError::process(name, "child stderr unavailable"))?;

    Ok(SpawnResult {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// Exit code and (on unix) terminating signal of a finished child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(sig)) => format!("killed by signal {sig}"),
            (None, None) => "exited".to_string(),
        }
    }
}

/// Deliver a named signal (`"SIGTERM"`, `"SIGINT"`, ...) to `pid`
///
/// Returns `Ok(false)` if the process no longer exists.
#[cfg(unix)]
pub fn send_signal(name: &str, pid: u32, signal: &str) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::str::FromStr;

    let sig = Signal::from_str(signal)
        .map_err(|_| McpError::process(name, format!("unknown signal '{signal}'")))?;
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(McpError::process(name, format!("kill({pid}, {signal}) failed: {e}"))),
    }
}

/// Deliver `signal` if possible; `false` means the caller should kill instead
#[cfg(unix)]
pub fn try_signal(name: &str, pid: Option<u32>, signal: &str) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    match send_signal(name, pid, signal) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(server = %name, error = %e, "Signal delivery failed, killing");
            false
        }
    }
}

#[cfg(not(unix))]
pub fn try_signal(_name: &str, _pid: Option<u32>, _signal: &str) -> bool {
    false
}

/// Whether `pid` still names a live process
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_info_describe() {
        assert_eq!(
            ExitInfo { code: Some(1), signal: None }.describe(),
            "exited with code 1"
        );
        assert_eq!(
            ExitInfo { code: None, signal: Some(9) }.describe(),
            "killed by signal 9"
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_command_is_process_error() {
        let err = spawn_process("ghost", &ServerConfig::new("/definitely/not/a/binary")).unwrap_err();
        assert_eq!(err.category(), "process");
        assert!(err.to_string().contains("ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_pipes_and_env() {
        use tokio::io::AsyncReadExt;

        let cfg = ServerConfig::new("sh")
            .arg("-c")
            .arg("printf \"$GREETING\"")
            .env("GREETING", "hello");
        let mut spawned = spawn_process("env", &cfg).unwrap();
        assert!(spawned.pid.is_some());

        let mut out = String::new();
        spawned.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
        let status = spawned.child.wait().await.unwrap();
        assert_eq!(ExitInfo::from_status(&status).code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_signal_unknown_name() {
        let err = send_signal("x", std::process::id(), "SIGNOPE").unwrap_err();
        assert!(err.to_string().contains("unknown signal"));
    }
}
