//! Global git configuration access.

use crate::constants;
use crate::errors::GenesisError;
use crate::util::command;
use std::process::Command;
use std::time::Duration;

fn tool_timeout() -> Duration {
    Duration::from_secs(constants::COMMAND_TIMEOUT_SECS)
}

/// Read one global git config value. git exits nonzero for an unset key,
/// which maps to `None`.
pub fn get_global(key: &str) -> Result<Option<String>, GenesisError> {
    let mut cmd = Command::new("git");
    cmd.arg("config").arg("--global").arg(key);
    let output = command::output_with_timeout(cmd, "git", tool_timeout())?;
    if !output.status.success() {
        return Ok(None);
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(if value.is_empty() { None } else { Some(value) })
}

pub fn set_global(key: &str, value: &str) -> Result<(), GenesisError> {
    let mut cmd = Command::new("git");
    cmd.arg("config").arg("--global").arg(key).arg(value);
    command::run_checked(cmd, "git", tool_timeout())
}
