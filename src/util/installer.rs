//! Nix installation and nix-darwin activation.

use crate::constants;
use crate::core::paths::GenesisPaths;
use crate::errors::GenesisError;
use crate::util::command;
use crate::util::fs as genesis_fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::info;

const INSTALLER_URL: &str = "https://install.determinate.systems/nix";

const USER_NIX_CONF: &str = "\
experimental-features = nix-command flakes\n\
auto-optimise-store = true\n";

/// Package-manager installation seam. The shell implementation drives the
/// Determinate Systems installer; tests substitute a fake. `rollback` is
/// the hook a future uninstall path plugs into.
pub trait PackageInstaller {
    fn install(&self) -> Result<(), GenesisError>;
    fn setup_flakes(&self, paths: &GenesisPaths) -> Result<(), GenesisError>;
    /// Confirm the installed toolchain actually runs.
    fn verify(&self) -> Result<(), GenesisError>;
    /// Activate the generated configuration bundle.
    fn apply(&self, config_dir: &Path) -> Result<(), GenesisError>;
    fn rollback(&self) -> Result<(), GenesisError> {
        Ok(())
    }
}

pub struct DeterminateInstaller;

impl PackageInstaller for DeterminateInstaller {
    fn install(&self) -> Result<(), GenesisError> {
        info!(url = INSTALLER_URL, "running nix installer");
        let script = format!(
            "curl --proto '=https' --tlsv1.2 -sSf -L {INSTALLER_URL} | sh -s -- install --no-confirm"
        );
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        command::run_interactive(
            cmd,
            "nix-installer",
            Duration::from_secs(constants::INSTALL_TIMEOUT_SECS),
        )
    }

    fn setup_flakes(&self, paths: &GenesisPaths) -> Result<(), GenesisError> {
        // The Determinate installer enables flakes system-wide; the user
        // level copy keeps `nix` working under plain multi-user installs too.
        let to_io = |e: anyhow::Error| GenesisError::Io(std::io::Error::other(e.to_string()));
        genesis_fs::ensure_dir(&paths.nix_conf_dir, 0o755).map_err(to_io)?;
        let conf = paths.nix_conf_dir.join("nix.conf");
        if conf.exists() {
            info!(path = %conf.display(), "user nix.conf already present; leaving it alone");
            return Ok(());
        }
        genesis_fs::atomic_write(&conf, USER_NIX_CONF.as_bytes(), constants::CONFIG_FILE_MODE)
            .map_err(to_io)?;
        Ok(())
    }

    fn verify(&self) -> Result<(), GenesisError> {
        let mut cmd = Command::new("nix");
        cmd.arg("--version");
        let out = command::output_checked(
            cmd,
            "nix",
            Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        )?;
        info!(version = %String::from_utf8_lossy(&out).trim(), "nix verified");
        Ok(())
    }

    fn apply(&self, config_dir: &Path) -> Result<(), GenesisError> {
        // First activation bootstraps nix-darwin itself; it may prompt for
        // sudo, so it keeps the terminal.
        let mut cmd = Command::new("nix");
        cmd.arg("run")
            .arg("nix-darwin")
            .arg("--experimental-features")
            .arg("nix-command flakes")
            .arg("--")
            .arg("switch")
            .arg("--flake")
            .arg(config_dir);
        command::run_interactive(
            cmd,
            "nix-darwin",
            Duration::from_secs(constants::INSTALL_TIMEOUT_SECS),
        )
    }
}
