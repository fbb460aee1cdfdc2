//! Bounded external command execution.
//!
//! Every shell-out in this crate goes through these helpers so that a hung
//! tool surfaces as a `Timeout` error instead of wedging the run.

use crate::errors::GenesisError;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether `name` resolves to an executable on PATH.
pub fn command_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Run a command with captured output, killing it at the deadline.
pub fn output_with_timeout(
    mut cmd: Command,
    tool: &str,
    timeout: Duration,
) -> Result<Output, GenesisError> {
    debug!(tool, ?timeout, "running external command");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let child = cmd.spawn().map_err(|e| spawn_error(tool, e))?;
    wait_with_deadline(child, tool, timeout)
}

/// Run a command and require exit code 0; stdout is returned raw.
pub fn output_checked(
    cmd: Command,
    tool: &str,
    timeout: Duration,
) -> Result<Vec<u8>, GenesisError> {
    let output = output_with_timeout(cmd, tool, timeout)?;
    if output.status.success() {
        return Ok(output.stdout);
    }
    Err(tool_failure(tool, &output))
}

/// Run a command and require exit code 0, discarding output.
pub fn run_checked(cmd: Command, tool: &str, timeout: Duration) -> Result<(), GenesisError> {
    output_checked(cmd, tool, timeout).map(|_| ())
}

/// Run a command that needs the terminal (interactive auth flows). The
/// deadline still applies; only the exit status is interpreted.
pub fn run_interactive(
    mut cmd: Command,
    tool: &str,
    timeout: Duration,
) -> Result<(), GenesisError> {
    debug!(tool, ?timeout, "running interactive external command");
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let mut child = cmd.spawn().map_err(|e| spawn_error(tool, e))?;
    let status = wait_status(&mut child, tool, timeout)?;
    if status.success() {
        return Ok(());
    }
    Err(GenesisError::ExternalTool {
        tool: tool.to_string(),
        code: status.code(),
        stderr: String::new(),
    })
}

fn spawn_error(tool: &str, err: std::io::Error) -> GenesisError {
    GenesisError::ExternalTool {
        tool: tool.to_string(),
        code: None,
        stderr: format!("failed to start: {err}"),
    }
}

fn tool_failure(tool: &str, output: &Output) -> GenesisError {
    let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if detail.is_empty() {
        detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
    }
    GenesisError::ExternalTool {
        tool: tool.to_string(),
        code: output.status.code(),
        stderr: detail,
    }
}

fn wait_with_deadline(
    mut child: Child,
    tool: &str,
    timeout: Duration,
) -> Result<Output, GenesisError> {
    // Drain pipes on threads so a chatty child cannot block on a full pipe
    // and outlive its deadline.
    let stdout_thread = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_thread = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let status = wait_status(&mut child, tool, timeout)?;
    let stdout = stdout_thread
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    let stderr = stderr_thread
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

fn wait_status(
    child: &mut Child,
    tool: &str,
    timeout: Duration,
) -> Result<ExitStatus, GenesisError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GenesisError::Timeout {
                tool: tool.to_string(),
                secs: timeout.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_output_checked_success() {
        let out = output_checked(sh("printf hello"), "sh", Duration::from_secs(5)).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_nonzero_exit_is_external_tool_failure() {
        let err =
            run_checked(sh("echo oops >&2; exit 3"), "sh", Duration::from_secs(5)).unwrap_err();
        match err {
            GenesisError::ExternalTool { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_deadline_kills_and_reports_timeout() {
        let err = run_checked(sh("sleep 5"), "sh", Duration::from_millis(100)).unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely-not-a-real-tool-xyz"));
    }
}
