//! Blocking command execution with captured output and hard timeouts.
//!
//! All step-level command execution funnels through this module. Commands
//! run to completion on the calling worker thread; a timed-out child is
//! killed via SIGKILL so a hung remote connector cannot wedge a worker
//! forever.

use crate::error::{OpsError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Fail with `CommandFailed` unless the command exited zero
    pub fn ensure_success(&self, command: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(OpsError::CommandFailed {
                command: command.to_string(),
                code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }

    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        }
    }
}

/// Run a shell command line in the given working directory
pub fn run_shell(command: &str, cwd: &Path, timeout: Option<Duration>) -> Result<CommandOutput> {
    debug!(command, cwd = %cwd.display(), "running shell command");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(cwd);
    run(cmd, command, timeout)
}

/// Run a prepared command, enforcing an optional wall-clock timeout
pub fn run(mut cmd: Command, label: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let Some(timeout) = timeout else {
        let output = cmd.output()?;
        return Ok(CommandOutput::from_output(output));
    };

    let child = cmd.spawn()?;
    let pid = child.id();

    // The child moves to a waiter thread; the caller blocks on the channel
    // so it can give up after the timeout and kill by pid.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => Ok(CommandOutput::from_output(result?)),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(label, pid, timeout_secs = timeout.as_secs(), "command timed out, killing");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                warn!(pid, error = %e, "failed to kill timed-out child");
            }
            // Reap the child so the waiter thread finishes
            let _ = rx.recv();
            Err(OpsError::CommandFailed {
                command: label.to_string(),
                code: -1,
                stderr: format!("timed out after {}s", timeout.as_secs()),
            })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(OpsError::CommandFailed {
            command: label.to_string(),
            code: -1,
            stderr: "command waiter thread disappeared".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_run_shell_captures_stdout() {
        let out = run_shell("echo hello", Path::new("."), None).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_shell_captures_stderr_on_failure() {
        let out = run_shell("echo oops >&2; exit 3", Path::new("."), None).unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr.trim(), "oops");

        let err = out.ensure_success("echo oops").unwrap_err();
        assert!(matches!(err, OpsError::CommandFailed { code: 3, .. }));
    }

    #[test]
    fn test_timeout_kills_hung_command() {
        let start = Instant::now();
        let err = run_shell("sleep 30", Path::new("."), Some(Duration::from_millis(200)))
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, OpsError::CommandFailed { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_fast_command_beats_timeout() {
        let out = run_shell("echo quick", Path::new("."), Some(Duration::from_secs(10))).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "quick");
    }
}
