//! Reader for the host preference store (`defaults read`).

use crate::constants;
use crate::errors::GenesisError;
use crate::util::command;
use std::process::Command;
use std::time::Duration;

/// Narrow interface over the preference store so the probe can be tested
/// against a fake. Read-only by contract.
pub trait DefaultsStore {
    /// Read one key. `Ok(None)` means the key is missing or unreadable,
    /// which callers must treat as "no current value".
    fn read(&self, domain: &str, key: &str) -> Result<Option<String>, GenesisError>;
}

/// Shells out to `defaults read <domain> <key>`. A nonzero exit is how the
/// tool reports a missing key, so it maps to `None` rather than an error.
pub struct DefaultsCommand;

impl DefaultsStore for DefaultsCommand {
    fn read(&self, domain: &str, key: &str) -> Result<Option<String>, GenesisError> {
        let mut cmd = Command::new("defaults");
        cmd.arg("read").arg(domain).arg(key);
        let output = command::output_with_timeout(
            cmd,
            "defaults",
            Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        )?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }
}
