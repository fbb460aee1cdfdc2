//! Hosting-provider CLI wrapper (`gh`).

use crate::constants;
use crate::errors::GenesisError;
use crate::util::command;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

fn tool_timeout() -> Duration {
    Duration::from_secs(constants::COMMAND_TIMEOUT_SECS)
}

/// The operations the orchestrator needs from the hosting provider's CLI.
pub trait HostingCli {
    /// Whether an authenticated session already exists.
    fn authenticated(&self) -> Result<bool, GenesisError>;

    /// Start the interactive login flow. Needs the terminal.
    fn login(&self) -> Result<(), GenesisError>;

    /// Register a public SSH key from a file, with a display title.
    fn add_ssh_key(&self, public_key: &Path, title: &str) -> Result<(), GenesisError>;

    /// Register an ASCII-armored GPG public key.
    fn add_gpg_key(&self, armored_public: &str) -> Result<(), GenesisError>;
}

/// GitHub via the `gh` CLI.
pub struct GithubCli;

impl HostingCli for GithubCli {
    fn authenticated(&self) -> Result<bool, GenesisError> {
        let mut cmd = Command::new("gh");
        cmd.arg("auth").arg("status");
        let output = command::output_with_timeout(cmd, "gh", tool_timeout())?;
        Ok(output.status.success())
    }

    fn login(&self) -> Result<(), GenesisError> {
        let mut cmd = Command::new("gh");
        cmd.arg("auth").arg("login").arg("--web");
        command::run_interactive(
            cmd,
            "gh",
            Duration::from_secs(constants::AUTH_TIMEOUT_SECS),
        )
    }

    fn add_ssh_key(&self, public_key: &Path, title: &str) -> Result<(), GenesisError> {
        let mut cmd = Command::new("gh");
        cmd.arg("ssh-key")
            .arg("add")
            .arg(public_key)
            .arg("--title")
            .arg(title);
        command::run_checked(cmd, "gh", tool_timeout())?;
        debug!(title, "ssh public key registered");
        Ok(())
    }

    fn add_gpg_key(&self, armored_public: &str) -> Result<(), GenesisError> {
        // gh reads the key from a file; only public material lands in it.
        let mut key_file = tempfile::NamedTempFile::new()?;
        key_file.write_all(armored_public.as_bytes())?;
        key_file.flush()?;
        let mut cmd = Command::new("gh");
        cmd.arg("gpg-key").arg("add").arg(key_file.path());
        command::run_checked(cmd, "gh", tool_timeout())?;
        debug!("gpg public key registered");
        Ok(())
    }
}
