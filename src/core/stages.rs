//! The fixed provisioning sequence.
//!
//! Stage order is a hard dependency chain: directories before tools, nix
//! before anything installed through it, credentials before the hosting
//! registration and git identity that reference them, a generated bundle
//! before activation.

use crate::constants;
use crate::core::paths::GenesisPaths;
use crate::core::probe;
use crate::core::provision::{CredentialProvisioner, KeyKind, SSH_SECRET_LABEL};
use crate::core::runner::{Stage, StageContext};
use crate::core::synth::{self, HostInfo};
use crate::core::vault::{PassphraseSource, Vault};
use crate::errors::GenesisError;
use crate::models::settings::{Identity, SettingsDocument};
use crate::util::command;
use crate::util::defaults::DefaultsStore;
use crate::util::fs as genesis_fs;
use crate::util::git;
use crate::util::hosting::HostingCli;
use crate::util::installer::PackageInstaller;
use crate::util::keygen::KeyGenerator;
use std::sync::Arc;
use tracing::{info, warn};

pub const PREPARE_SYSTEM: &str = "prepare-system";
pub const INSTALL_NIX: &str = "install-nix";
pub const PROVISION_SSH: &str = "provision-ssh";
pub const PROVISION_GPG: &str = "provision-gpg";
pub const SETUP_PASSWORD_STORE: &str = "setup-password-store";
pub const HOSTING_AUTH: &str = "hosting-auth";
pub const CONFIGURE_GIT: &str = "configure-git";
pub const GENERATE_CONFIG: &str = "generate-config";
pub const APPLY_CONFIG: &str = "apply-config";

/// Stage names in execution order.
pub const STAGE_ORDER: &[&str] = &[
    PREPARE_SYSTEM,
    INSTALL_NIX,
    PROVISION_SSH,
    PROVISION_GPG,
    SETUP_PASSWORD_STORE,
    HOSTING_AUTH,
    CONFIGURE_GIT,
    GENERATE_CONFIG,
    APPLY_CONFIG,
];

/// Everything the stage set needs, assembled once per invocation.
pub struct StageDeps {
    pub paths: Arc<GenesisPaths>,
    pub settings: Arc<SettingsDocument>,
    pub identity: Identity,
    pub passphrase: Arc<dyn PassphraseSource>,
    pub keygen: Arc<dyn KeyGenerator>,
    pub hosting: Arc<dyn HostingCli>,
    pub installer: Arc<dyn PackageInstaller>,
    pub defaults: Arc<dyn DefaultsStore>,
    pub host: HostInfo,
    /// Clone this repository as the configuration bundle instead of
    /// synthesizing one.
    pub private_repo: Option<String>,
    /// Clone this repository as the password store instead of initializing
    /// an empty one.
    pub password_repo: Option<String>,
    /// Regenerate credentials even when material already exists.
    pub force: bool,
}

/// Build the standard nine-stage sequence.
pub fn standard_stages(deps: StageDeps) -> Vec<Box<dyn Stage>> {
    let StageDeps {
        paths,
        settings,
        identity,
        passphrase,
        keygen,
        hosting,
        installer,
        defaults,
        host,
        private_repo,
        password_repo,
        force,
    } = deps;

    vec![
        Box::new(PrepareSystemStage {
            paths: Arc::clone(&paths),
        }),
        Box::new(InstallNixStage {
            paths: Arc::clone(&paths),
            installer: Arc::clone(&installer),
        }),
        Box::new(ProvisionSshStage {
            paths: Arc::clone(&paths),
            keygen: Arc::clone(&keygen),
            hosting: Arc::clone(&hosting),
            identity: identity.clone(),
            passphrase: Arc::clone(&passphrase),
            host: host.clone(),
            force,
        }),
        Box::new(ProvisionGpgStage {
            paths: Arc::clone(&paths),
            keygen: Arc::clone(&keygen),
            hosting: Arc::clone(&hosting),
            identity: identity.clone(),
            passphrase,
            force,
        }),
        Box::new(PasswordStoreStage {
            paths: Arc::clone(&paths),
            keygen: Arc::clone(&keygen),
            identity: identity.clone(),
            password_repo,
        }),
        Box::new(HostingAuthStage {
            hosting: Arc::clone(&hosting),
        }),
        Box::new(ConfigureGitStage {
            keygen,
            identity,
        }),
        Box::new(GenerateConfigStage {
            paths: Arc::clone(&paths),
            settings,
            defaults,
            host,
            private_repo,
        }),
        Box::new(ApplyConfigStage { paths, installer }),
    ]
}

// ---- prepare-system -------------------------------------------------------

/// Creates the directory skeleton with owner-only modes on secret dirs.
struct PrepareSystemStage {
    paths: Arc<GenesisPaths>,
}

impl Stage for PrepareSystemStage {
    fn name(&self) -> &str {
        PREPARE_SYSTEM
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        Ok(self.paths.state_dir.is_dir()
            && self.paths.ssh_dir.is_dir()
            && self.paths.vault_dir.is_dir())
    }

    fn run(&self, ctx: &StageContext) -> Result<(), GenesisError> {
        // git missing means the Xcode command line tools are not installed.
        if !command::command_exists("git")
            && ctx.confirm("Install the Xcode command line tools?")
        {
            let mut cmd = std::process::Command::new("xcode-select");
            cmd.arg("--install");
            if let Err(e) = command::run_interactive(
                cmd,
                "xcode-select",
                std::time::Duration::from_secs(constants::INSTALL_TIMEOUT_SECS),
            ) {
                warn!(error = %e, "xcode-select reported an error; it may already be installed");
            }
        }

        let to_io = |e: anyhow::Error| GenesisError::Io(std::io::Error::other(e.to_string()));
        genesis_fs::ensure_dir(&self.paths.state_dir, constants::SECRET_DIR_MODE).map_err(to_io)?;
        genesis_fs::ensure_dir(&self.paths.vault_dir, constants::SECRET_DIR_MODE).map_err(to_io)?;
        genesis_fs::ensure_dir(&self.paths.ssh_dir, constants::SECRET_DIR_MODE).map_err(to_io)?;
        genesis_fs::ensure_dir(&self.paths.config_dir, 0o755).map_err(to_io)?;
        genesis_fs::ensure_dir(&self.paths.nix_conf_dir, 0o755).map_err(to_io)?;
        info!(home = %self.paths.home.display(), "directory skeleton ready");
        Ok(())
    }
}

// ---- install-nix ----------------------------------------------------------

struct InstallNixStage {
    paths: Arc<GenesisPaths>,
    installer: Arc<dyn PackageInstaller>,
}

impl Stage for InstallNixStage {
    fn name(&self) -> &str {
        INSTALL_NIX
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        Ok(command::command_exists("nix"))
    }

    fn run(&self, ctx: &StageContext) -> Result<(), GenesisError> {
        if !ctx.confirm("Install Nix with the Determinate Systems installer?") {
            return Err(GenesisError::ExternalTool {
                tool: "nix-installer".to_string(),
                code: None,
                stderr: "installation declined".to_string(),
            });
        }
        self.installer.install()?;
        self.installer.setup_flakes(&self.paths)?;
        self.installer.verify()
    }
}

// ---- provision-ssh / provision-gpg ---------------------------------------

struct ProvisionSshStage {
    paths: Arc<GenesisPaths>,
    keygen: Arc<dyn KeyGenerator>,
    hosting: Arc<dyn HostingCli>,
    identity: Identity,
    passphrase: Arc<dyn PassphraseSource>,
    host: HostInfo,
    force: bool,
}

impl Stage for ProvisionSshStage {
    fn name(&self) -> &str {
        PROVISION_SSH
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        // Complete means local material AND a recorded upload. After a
        // failed upload the key exists and is sealed but the registration
        // marker does not, so the stage stays eligible to retry.
        if self.force {
            return Ok(false);
        }
        let key = self.paths.ssh_dir.join(constants::SSH_KEY_NAME);
        let vault = Vault::new(&self.paths.vault_dir);
        let provisioner =
            CredentialProvisioner::new(&*self.keygen, &*self.hosting, &vault, &self.paths);
        Ok(key.exists()
            && vault.contains(SSH_SECRET_LABEL)
            && provisioner.registered(KeyKind::Ssh))
    }

    fn run(&self, _ctx: &StageContext) -> Result<(), GenesisError> {
        let vault = Vault::new(&self.paths.vault_dir);
        let provisioner =
            CredentialProvisioner::new(&*self.keygen, &*self.hosting, &vault, &self.paths);
        let title = format!("{} - nix-mac-genesis", self.host.hostname);
        let passphrase = self.passphrase.passphrase()?;
        provisioner.provision_ssh(&self.identity, &passphrase, &title, self.force)?;
        Ok(())
    }
}

struct ProvisionGpgStage {
    paths: Arc<GenesisPaths>,
    keygen: Arc<dyn KeyGenerator>,
    hosting: Arc<dyn HostingCli>,
    identity: Identity,
    passphrase: Arc<dyn PassphraseSource>,
    force: bool,
}

impl Stage for ProvisionGpgStage {
    fn name(&self) -> &str {
        PROVISION_GPG
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        if self.force {
            return Ok(false);
        }
        let vault = Vault::new(&self.paths.vault_dir);
        let provisioner =
            CredentialProvisioner::new(&*self.keygen, &*self.hosting, &vault, &self.paths);
        Ok(self
            .keygen
            .gpg_existing_fingerprint(&self.identity.git_email)?
            .is_some()
            && provisioner.registered(KeyKind::Gpg))
    }

    fn run(&self, _ctx: &StageContext) -> Result<(), GenesisError> {
        let vault = Vault::new(&self.paths.vault_dir);
        let provisioner =
            CredentialProvisioner::new(&*self.keygen, &*self.hosting, &vault, &self.paths);
        let passphrase = self.passphrase.passphrase()?;
        provisioner.provision_gpg(&self.identity, &passphrase, self.force)?;
        Ok(())
    }
}

// ---- setup-password-store -------------------------------------------------

/// Initializes the `pass` store against the provisioned GPG key and points
/// gpg-agent at a macOS pinentry.
struct PasswordStoreStage {
    paths: Arc<GenesisPaths>,
    keygen: Arc<dyn KeyGenerator>,
    identity: Identity,
    password_repo: Option<String>,
}

impl Stage for PasswordStoreStage {
    fn name(&self) -> &str {
        SETUP_PASSWORD_STORE
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        Ok(self.paths.password_store_dir.join(".gpg-id").exists())
    }

    fn run(&self, _ctx: &StageContext) -> Result<(), GenesisError> {
        if let Some(repo) = &self.password_repo {
            if self.paths.password_store_dir.exists() {
                warn!(
                    store = %self.paths.password_store_dir.display(),
                    "existing password store kept; not cloning over it"
                );
            } else {
                info!(repo, "cloning existing password store");
                let mut cmd = std::process::Command::new("git");
                cmd.arg("clone").arg(repo).arg(&self.paths.password_store_dir);
                command::run_checked(
                    cmd,
                    "git",
                    std::time::Duration::from_secs(constants::AUTH_TIMEOUT_SECS),
                )?;
                write_gpg_agent_conf(&self.paths)?;
                restart_gpg_agent();
                return Ok(());
            }
        }

        let fingerprint = self
            .keygen
            .gpg_existing_fingerprint(&self.identity.git_email)?
            .ok_or_else(|| GenesisError::ExternalTool {
                tool: "gpg".to_string(),
                code: None,
                stderr: format!(
                    "no secret key for {}; the signing key has to exist before the store can be initialized",
                    self.identity.git_email
                ),
            })?;
        info!(%fingerprint, "initializing password store");
        let mut cmd = std::process::Command::new("pass");
        cmd.arg("init").arg(&fingerprint);
        command::run_checked(
            cmd,
            "pass",
            std::time::Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        )?;
        write_gpg_agent_conf(&self.paths)?;
        restart_gpg_agent();
        Ok(())
    }
}

const GPG_AGENT_CONF: &str = "default-cache-ttl 3600\n\
                              max-cache-ttl 86400\n\
                              pinentry-program /opt/homebrew/bin/pinentry-mac\n";

/// Write the gpg-agent caching/pinentry config unless one already exists.
/// Returns whether a file was written.
fn write_gpg_agent_conf(paths: &GenesisPaths) -> Result<bool, GenesisError> {
    let conf = paths.gnupg_dir.join("gpg-agent.conf");
    if conf.exists() {
        return Ok(false);
    }
    let to_io = |e: anyhow::Error| GenesisError::Io(std::io::Error::other(e.to_string()));
    genesis_fs::ensure_dir(&paths.gnupg_dir, constants::SECRET_DIR_MODE).map_err(to_io)?;
    genesis_fs::atomic_write(&conf, GPG_AGENT_CONF.as_bytes(), constants::SECRET_FILE_MODE)
        .map_err(to_io)?;
    Ok(true)
}

/// Agent restart is best effort; a missing or stopped agent is not fatal.
fn restart_gpg_agent() {
    let mut cmd = std::process::Command::new("gpgconf");
    cmd.arg("--kill").arg("gpg-agent");
    if let Err(e) = command::run_checked(
        cmd,
        "gpgconf",
        std::time::Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
    ) {
        warn!(error = %e, "gpg-agent restart skipped");
    }
}

// ---- hosting-auth ---------------------------------------------------------

struct HostingAuthStage {
    hosting: Arc<dyn HostingCli>,
}

impl Stage for HostingAuthStage {
    fn name(&self) -> &str {
        HOSTING_AUTH
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        self.hosting.authenticated()
    }

    fn run(&self, ctx: &StageContext) -> Result<(), GenesisError> {
        if !ctx.confirm("Open the browser-based GitHub login flow?") {
            return Err(GenesisError::ExternalTool {
                tool: "gh".to_string(),
                code: None,
                stderr: "login declined".to_string(),
            });
        }
        self.hosting.login()
    }
}

// ---- configure-git --------------------------------------------------------

/// Sets the global git identity and, when a signing key exists, commit
/// signing.
struct ConfigureGitStage {
    keygen: Arc<dyn KeyGenerator>,
    identity: Identity,
}

impl Stage for ConfigureGitStage {
    fn name(&self) -> &str {
        CONFIGURE_GIT
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        let name = git::get_global("user.name")?;
        let email = git::get_global("user.email")?;
        Ok(name.as_deref() == Some(&self.identity.git_name)
            && email.as_deref() == Some(&self.identity.git_email))
    }

    fn run(&self, _ctx: &StageContext) -> Result<(), GenesisError> {
        git::set_global("user.name", &self.identity.git_name)?;
        git::set_global("user.email", &self.identity.git_email)?;
        git::set_global("init.defaultBranch", "main")?;
        git::set_global("pull.rebase", "false")?;
        git::set_global("push.autoSetupRemote", "true")?;
        if let Some(fingerprint) = self
            .keygen
            .gpg_existing_fingerprint(&self.identity.git_email)?
        {
            git::set_global("user.signingkey", &fingerprint)?;
            git::set_global("commit.gpgsign", "true")?;
            info!(%fingerprint, "commit signing enabled");
        }
        Ok(())
    }
}

// ---- generate-config ------------------------------------------------------

struct GenerateConfigStage {
    paths: Arc<GenesisPaths>,
    settings: Arc<SettingsDocument>,
    defaults: Arc<dyn DefaultsStore>,
    host: HostInfo,
    private_repo: Option<String>,
}

impl Stage for GenerateConfigStage {
    fn name(&self) -> &str {
        GENERATE_CONFIG
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        let entry = self.paths.config_dir.join("flake.nix");
        let system = self.paths.modules_dir.join("system.nix");
        Ok(entry.exists() && system.exists())
    }

    fn run(&self, _ctx: &StageContext) -> Result<(), GenesisError> {
        if let Some(repo) = &self.private_repo {
            info!(repo, "cloning existing configuration repository");
            let mut cmd = std::process::Command::new("git");
            cmd.arg("clone").arg(repo).arg(&self.paths.config_dir);
            return command::run_checked(
                cmd,
                "git",
                std::time::Duration::from_secs(constants::AUTH_TIMEOUT_SECS),
            );
        }
        let snapshot = probe::probe(&*self.defaults, probe::standard_keys());
        info!(probed = snapshot.len(), "host preferences captured");
        let bundle = synth::synthesize(&self.settings, &snapshot, &self.host)?;
        synth::write_bundle(&self.paths, &bundle)
    }
}

// ---- apply-config ---------------------------------------------------------

struct ApplyConfigStage {
    paths: Arc<GenesisPaths>,
    installer: Arc<dyn PackageInstaller>,
}

impl Stage for ApplyConfigStage {
    fn name(&self) -> &str {
        APPLY_CONFIG
    }

    fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
        // Activation installs darwin-rebuild; its presence means a prior
        // switch completed on this host.
        Ok(command::command_exists("darwin-rebuild"))
    }

    fn run(&self, ctx: &StageContext) -> Result<(), GenesisError> {
        if !ctx.confirm("Apply the generated nix-darwin configuration now?") {
            return Err(GenesisError::ExternalTool {
                tool: "nix-darwin".to_string(),
                code: None,
                stderr: "activation declined".to_string(),
            });
        }
        self.installer.apply(&self.paths.config_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runner::AlwaysYes;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    struct EmptyDefaults;

    impl DefaultsStore for EmptyDefaults {
        fn read(&self, _domain: &str, _key: &str) -> Result<Option<String>, GenesisError> {
            Ok(None)
        }
    }

    struct StubKeygen;

    impl KeyGenerator for StubKeygen {
        fn ssh_generate(&self, path: &Path, comment: &str) -> Result<(), GenesisError> {
            std::fs::write(path, b"KEY")?;
            let blob = STANDARD.encode(b"\x00\x00\x00\x0bssh-ed25519 stub");
            std::fs::write(path.with_extension("pub"), format!("ssh-ed25519 {blob} {comment}"))?;
            Ok(())
        }

        fn gpg_generate(&self, _identity: &Identity) -> Result<String, GenesisError> {
            Ok("STUBFPR".to_string())
        }

        fn gpg_existing_fingerprint(&self, _email: &str) -> Result<Option<String>, GenesisError> {
            Ok(Some("STUBFPR".to_string()))
        }

        fn gpg_export_public(&self, fingerprint: &str) -> Result<String, GenesisError> {
            Ok(format!("PUB {fingerprint}"))
        }

        fn gpg_export_secret(
            &self,
            fingerprint: &str,
        ) -> Result<Zeroizing<Vec<u8>>, GenesisError> {
            Ok(Zeroizing::new(format!("SEC {fingerprint}").into_bytes()))
        }
    }

    #[derive(Default)]
    struct FlakyHosting {
        fail: AtomicBool,
        adds: AtomicUsize,
    }

    impl HostingCli for FlakyHosting {
        fn authenticated(&self) -> Result<bool, GenesisError> {
            Ok(true)
        }

        fn login(&self) -> Result<(), GenesisError> {
            Ok(())
        }

        fn add_ssh_key(&self, _public_key: &Path, _title: &str) -> Result<(), GenesisError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GenesisError::ExternalTool {
                    tool: "gh".to_string(),
                    code: Some(1),
                    stderr: "api error".to_string(),
                });
            }
            self.adds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn add_gpg_key(&self, _armored_public: &str) -> Result<(), GenesisError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GenesisError::ExternalTool {
                    tool: "gh".to_string(),
                    code: Some(1),
                    stderr: "api error".to_string(),
                });
            }
            self.adds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingPassphrase(AtomicUsize);

    impl PassphraseSource for CountingPassphrase {
        fn passphrase(&self) -> Result<Zeroizing<String>, GenesisError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Zeroizing::new("pw".to_string()))
        }
    }

    fn test_identity() -> Identity {
        Identity {
            github_user: "dev".to_string(),
            git_name: "Dev".to_string(),
            git_email: "dev@example.com".to_string(),
        }
    }

    fn ctx() -> StageContext {
        StageContext::new(true, false, Box::new(AlwaysYes))
    }

    #[test]
    fn test_stage_order_is_fixed() {
        assert_eq!(
            STAGE_ORDER,
            &[
                "prepare-system",
                "install-nix",
                "provision-ssh",
                "provision-gpg",
                "setup-password-store",
                "hosting-auth",
                "configure-git",
                "generate-config",
                "apply-config",
            ]
        );
    }

    #[test]
    fn test_ssh_stage_retries_registration_after_failed_upload() {
        let dir = TempDir::new().unwrap();
        let paths = Arc::new(GenesisPaths::from_home(dir.path().to_path_buf(), None));
        let hosting = Arc::new(FlakyHosting::default());
        hosting.fail.store(true, Ordering::SeqCst);
        let stage = ProvisionSshStage {
            paths: Arc::clone(&paths),
            keygen: Arc::new(StubKeygen),
            hosting: Arc::clone(&hosting) as Arc<dyn HostingCli>,
            identity: test_identity(),
            passphrase: Arc::new(CountingPassphrase::default()),
            host: HostInfo {
                hostname: "mbp".to_string(),
                username: "dev".to_string(),
            },
            force: false,
        };

        assert!(stage.run(&ctx()).is_err());
        // Key generated and sealed, but the upload is still owed: the gate
        // keeps the stage eligible for another attempt.
        assert!(paths.ssh_dir.join(constants::SSH_KEY_NAME).exists());
        assert!(!stage.is_complete(&ctx()).unwrap());

        hosting.fail.store(false, Ordering::SeqCst);
        stage.run(&ctx()).unwrap();
        assert_eq!(hosting.adds.load(Ordering::SeqCst), 1);
        assert!(stage.is_complete(&ctx()).unwrap());
    }

    #[test]
    fn test_passphrase_not_resolved_when_gate_reports_complete() {
        let dir = TempDir::new().unwrap();
        let paths = Arc::new(GenesisPaths::from_home(dir.path().to_path_buf(), None));
        let hosting = Arc::new(FlakyHosting::default());
        let setup = ProvisionSshStage {
            paths: Arc::clone(&paths),
            keygen: Arc::new(StubKeygen),
            hosting: Arc::clone(&hosting) as Arc<dyn HostingCli>,
            identity: test_identity(),
            passphrase: Arc::new(CountingPassphrase::default()),
            host: HostInfo {
                hostname: "mbp".to_string(),
                username: "dev".to_string(),
            },
            force: false,
        };
        setup.run(&ctx()).unwrap();

        // A fresh invocation over completed material never asks for the
        // passphrase.
        let counting = Arc::new(CountingPassphrase::default());
        let rerun = ProvisionSshStage {
            paths: Arc::clone(&paths),
            keygen: Arc::new(StubKeygen),
            hosting: hosting as Arc<dyn HostingCli>,
            identity: test_identity(),
            passphrase: Arc::clone(&counting) as Arc<dyn PassphraseSource>,
            host: HostInfo {
                hostname: "mbp".to_string(),
                username: "dev".to_string(),
            },
            force: false,
        };
        assert!(rerun.is_complete(&ctx()).unwrap());
        assert_eq!(counting.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_password_store_gate_is_gpg_id_presence() {
        let dir = TempDir::new().unwrap();
        let paths = Arc::new(GenesisPaths::from_home(dir.path().to_path_buf(), None));
        let stage = PasswordStoreStage {
            paths: Arc::clone(&paths),
            keygen: Arc::new(StubKeygen),
            identity: test_identity(),
            password_repo: None,
        };

        assert!(!stage.is_complete(&ctx()).unwrap());
        std::fs::create_dir_all(&paths.password_store_dir).unwrap();
        std::fs::write(paths.password_store_dir.join(".gpg-id"), "STUBFPR\n").unwrap();
        assert!(stage.is_complete(&ctx()).unwrap());
    }

    #[test]
    fn test_gpg_agent_conf_written_once_and_never_clobbered() {
        let dir = TempDir::new().unwrap();
        let paths = GenesisPaths::from_home(dir.path().to_path_buf(), None);
        assert!(write_gpg_agent_conf(&paths).unwrap());
        let conf = paths.gnupg_dir.join("gpg-agent.conf");
        assert!(std::fs::read_to_string(&conf)
            .unwrap()
            .contains("pinentry-program"));

        std::fs::write(&conf, "default-cache-ttl 60\n").unwrap();
        assert!(!write_gpg_agent_conf(&paths).unwrap());
        assert_eq!(
            std::fs::read_to_string(&conf).unwrap(),
            "default-cache-ttl 60\n"
        );
    }

    #[test]
    fn test_prepare_system_creates_skeleton_and_completes() {
        let dir = TempDir::new().unwrap();
        let paths = Arc::new(GenesisPaths::from_home(dir.path().to_path_buf(), None));
        let stage = PrepareSystemStage {
            paths: Arc::clone(&paths),
        };

        assert!(!stage.is_complete(&ctx()).unwrap());
        stage.run(&ctx()).unwrap();
        assert!(stage.is_complete(&ctx()).unwrap());
        assert!(paths.vault_dir.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.ssh_dir)
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn test_generate_config_writes_bundle() {
        let dir = TempDir::new().unwrap();
        let paths = Arc::new(GenesisPaths::from_home(dir.path().to_path_buf(), None));
        let settings =
            Arc::new(SettingsDocument::parse(crate::models::settings::DEFAULT_SETTINGS).unwrap());
        let stage = GenerateConfigStage {
            paths: Arc::clone(&paths),
            settings,
            defaults: Arc::new(EmptyDefaults),
            host: HostInfo {
                hostname: "mbp".to_string(),
                username: "dev".to_string(),
            },
            private_repo: None,
        };

        assert!(!stage.is_complete(&ctx()).unwrap());
        stage.run(&ctx()).unwrap();
        assert!(stage.is_complete(&ctx()).unwrap());
        assert!(paths.config_dir.join("flake.nix").exists());
        assert!(paths.modules_dir.join("homebrew.nix").exists());

        // Defaults flow through when nothing was probed.
        let system = std::fs::read_to_string(paths.modules_dir.join("system.nix")).unwrap();
        assert!(system.contains("autohide = true;"));
    }
}
