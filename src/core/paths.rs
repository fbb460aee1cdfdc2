//! Provisioning path resolution and directory structure.

use crate::constants;
use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;

/// Every filesystem location the orchestrator touches, derived once from
/// the home directory so no component does ambient path lookups.
#[derive(Debug, Clone)]
pub struct GenesisPaths {
    pub home: PathBuf,
    /// ~/.config/nix-darwin, the generated bundle's target directory.
    pub config_dir: PathBuf,
    /// ~/.config/nix-darwin/modules
    pub modules_dir: PathBuf,
    /// ~/.config/nix, where user-level nix.conf lives.
    pub nix_conf_dir: PathBuf,
    /// ~/.ssh
    pub ssh_dir: PathBuf,
    /// ~/.gnupg
    pub gnupg_dir: PathBuf,
    /// ~/.password-store
    pub password_store_dir: PathBuf,
    /// ~/.local/state/nix-mac-genesis: ledger, lock, vault.
    pub state_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub ledger_lock: PathBuf,
    pub vault_dir: PathBuf,
    /// ~/.config/nix-mac-genesis/settings.toml unless overridden.
    pub settings_path: PathBuf,
}

impl GenesisPaths {
    /// Resolve from CLI arg, `GENESIS_HOME`, or `$HOME`.
    pub fn resolve(home_arg: Option<PathBuf>, settings_arg: Option<PathBuf>) -> Result<Self> {
        let home = match home_arg {
            Some(h) => h,
            None => match env::var_os("GENESIS_HOME") {
                Some(h) => PathBuf::from(h),
                None => match env::var_os("HOME") {
                    Some(h) => PathBuf::from(h),
                    None => bail!("cannot resolve home directory: $HOME is not set"),
                },
            },
        };
        Ok(Self::from_home(home, settings_arg))
    }

    /// Derive every path from a home directory.
    pub fn from_home(home: PathBuf, settings_arg: Option<PathBuf>) -> Self {
        let config_dir = home.join(".config/nix-darwin");
        let modules_dir = config_dir.join("modules");
        let nix_conf_dir = home.join(".config/nix");
        let ssh_dir = home.join(".ssh");
        let gnupg_dir = home.join(".gnupg");
        let password_store_dir = home.join(".password-store");
        let state_dir = home.join(".local/state/nix-mac-genesis");
        let ledger_path = state_dir.join(constants::LEDGER_FILE);
        let ledger_lock = state_dir.join(constants::LEDGER_LOCK);
        let vault_dir = state_dir.join(constants::VAULT_DIR);
        let settings_path = settings_arg
            .unwrap_or_else(|| home.join(".config/nix-mac-genesis/settings.toml"));
        Self {
            home,
            config_dir,
            modules_dir,
            nix_conf_dir,
            ssh_dir,
            gnupg_dir,
            password_store_dir,
            state_dir,
            ledger_path,
            ledger_lock,
            vault_dir,
            settings_path,
        }
    }
}

impl std::fmt::Display for GenesisPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "genesis@{}", self.home.display())
    }
}
