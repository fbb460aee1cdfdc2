//! Credential provisioner: SSH/GPG key material and hosting registration.
//!
//! Private key material is sealed into the vault before any registration
//! attempt, so a failed upload never loses the generated key. Plaintext
//! private parts exist only in memory (zeroized) and in the files the
//! consuming tools own (`~/.ssh`, the gpg keyring).
//!
//! Registration success is recorded in a marker file separate from the key
//! material. After a failed upload the key exists and is sealed but the
//! marker does not, so a rerun re-attempts the upload alone.

use crate::constants;
use crate::core::paths::GenesisPaths;
use crate::core::vault::Vault;
use crate::errors::GenesisError;
use crate::models::settings::Identity;
use crate::util::fs as genesis_fs;
use crate::util::hosting::HostingCli;
use crate::util::keygen::KeyGenerator;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const SSH_SECRET_LABEL: &str = "ssh-private";
pub const GPG_SECRET_LABEL: &str = "gpg-private";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Ssh,
    Gpg,
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ssh => "ssh",
            Self::Gpg => "gpg",
        })
    }
}

/// Public description of a provisioned key. Never carries private material.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub kind: KeyKind,
    pub public_part: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Whether provisioning created a key or found one already in place.
#[derive(Debug, Clone)]
pub enum Provisioned {
    Created(KeyMaterial),
    Existing(KeyMaterial),
}

impl Provisioned {
    pub fn material(&self) -> &KeyMaterial {
        match self {
            Self::Created(m) | Self::Existing(m) => m,
        }
    }
}

pub struct CredentialProvisioner<'a> {
    keygen: &'a dyn KeyGenerator,
    hosting: &'a dyn HostingCli,
    vault: &'a Vault,
    paths: &'a GenesisPaths,
}

impl<'a> CredentialProvisioner<'a> {
    pub fn new(
        keygen: &'a dyn KeyGenerator,
        hosting: &'a dyn HostingCli,
        vault: &'a Vault,
        paths: &'a GenesisPaths,
    ) -> Self {
        Self {
            keygen,
            hosting,
            vault,
            paths,
        }
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.paths.ssh_dir.join(constants::SSH_KEY_NAME)
    }

    fn ssh_pub_path(&self) -> PathBuf {
        self.paths
            .ssh_dir
            .join(format!("{}.pub", constants::SSH_KEY_NAME))
    }

    fn registration_marker(&self, kind: KeyKind) -> PathBuf {
        self.paths.state_dir.join(match kind {
            KeyKind::Ssh => constants::SSH_REGISTERED_MARKER,
            KeyKind::Gpg => constants::GPG_REGISTERED_MARKER,
        })
    }

    /// True once the public half of this key has been uploaded to the
    /// hosting provider.
    pub fn registered(&self, kind: KeyKind) -> bool {
        self.registration_marker(kind).exists()
    }

    fn mark_registered(&self, kind: KeyKind, fingerprint: &str) -> Result<(), GenesisError> {
        let to_io = |e: anyhow::Error| GenesisError::Io(std::io::Error::other(e.to_string()));
        genesis_fs::ensure_dir(&self.paths.state_dir, constants::SECRET_DIR_MODE).map_err(to_io)?;
        genesis_fs::atomic_write(
            &self.registration_marker(kind),
            format!("{fingerprint}\n").as_bytes(),
            constants::CONFIG_FILE_MODE,
        )
        .map_err(to_io)
    }

    /// Provision the SSH keypair and register its public half under
    /// `title`. An existing keypair is reused unless `force` is set.
    pub fn provision_ssh(
        &self,
        identity: &Identity,
        passphrase: &str,
        title: &str,
        force: bool,
    ) -> Result<Provisioned, GenesisError> {
        match self.existing_ssh() {
            Err(GenesisError::AlreadyProvisioned { what, path }) if force => {
                info!(what, path = %path.display(), "regenerating on request");
                fs::remove_file(&path)?;
                let pub_path = self.ssh_pub_path();
                if pub_path.exists() {
                    fs::remove_file(&pub_path)?;
                }
            }
            Err(GenesisError::AlreadyProvisioned { path, .. }) => {
                info!(path = %path.display(), "reusing existing ssh key");
                self.write_ssh_config()?;
                let material = self.ssh_material()?;
                if !self.registered(KeyKind::Ssh) {
                    self.hosting.add_ssh_key(&self.ssh_pub_path(), title)?;
                    self.mark_registered(KeyKind::Ssh, &material.fingerprint)?;
                    info!(fingerprint = %material.fingerprint, "existing ssh key registered");
                }
                return Ok(Provisioned::Existing(material));
            }
            Err(other) => return Err(other),
            Ok(()) => {}
        }

        let to_io = |e: anyhow::Error| GenesisError::Io(std::io::Error::other(e.to_string()));
        genesis_fs::ensure_dir(&self.paths.ssh_dir, constants::SECRET_DIR_MODE).map_err(to_io)?;
        let key_path = self.ssh_key_path();
        self.keygen.ssh_generate(&key_path, &identity.git_email)?;
        genesis_fs::set_permissions(&key_path, constants::SECRET_FILE_MODE).map_err(to_io)?;
        genesis_fs::set_permissions(&self.ssh_pub_path(), constants::PUBLIC_FILE_MODE)
            .map_err(to_io)?;

        // Seal a vault copy before touching the network.
        let private = Zeroizing::new(fs::read(&key_path)?);
        self.vault.store(SSH_SECRET_LABEL, passphrase, &private)?;
        drop(private);

        self.write_ssh_config()?;
        let material = self.ssh_material()?;
        self.hosting.add_ssh_key(&self.ssh_pub_path(), title)?;
        self.mark_registered(KeyKind::Ssh, &material.fingerprint)?;
        info!(fingerprint = %material.fingerprint, "ssh key provisioned and registered");
        Ok(Provisioned::Created(material))
    }

    /// Provision the GPG signing key and register its public half. An
    /// existing key for the identity's email is reused unless `force`.
    pub fn provision_gpg(
        &self,
        identity: &Identity,
        passphrase: &str,
        force: bool,
    ) -> Result<Provisioned, GenesisError> {
        if let Some(fingerprint) = self.keygen.gpg_existing_fingerprint(&identity.git_email)? {
            if !force {
                info!(%fingerprint, "reusing existing gpg key");
                let public_part = self.keygen.gpg_export_public(&fingerprint)?;
                if !self.registered(KeyKind::Gpg) {
                    self.hosting.add_gpg_key(&public_part)?;
                    self.mark_registered(KeyKind::Gpg, &fingerprint)?;
                    info!(%fingerprint, "existing gpg key registered");
                }
                return Ok(Provisioned::Existing(KeyMaterial {
                    kind: KeyKind::Gpg,
                    public_part,
                    fingerprint,
                    created_at: Utc::now(),
                }));
            }
            warn!(%fingerprint, "force set; generating a new gpg key alongside the old one");
        }

        let fingerprint = self.keygen.gpg_generate(identity)?;
        let secret = self.keygen.gpg_export_secret(&fingerprint)?;
        self.vault.store(GPG_SECRET_LABEL, passphrase, &secret)?;
        drop(secret);

        let public_part = self.keygen.gpg_export_public(&fingerprint)?;
        self.hosting.add_gpg_key(&public_part)?;
        self.mark_registered(KeyKind::Gpg, &fingerprint)?;
        info!(%fingerprint, "gpg key provisioned and registered");
        Ok(Provisioned::Created(KeyMaterial {
            kind: KeyKind::Gpg,
            public_part,
            fingerprint,
            created_at: Utc::now(),
        }))
    }

    /// Append the github.com host block to ~/.ssh/config unless one is
    /// already there.
    fn write_ssh_config(&self) -> Result<(), GenesisError> {
        let config_path = self.paths.ssh_dir.join("config");
        let block = format!(
            "Host github.com\n    HostName github.com\n    User git\n    IdentityFile ~/.ssh/{}\n    AddKeysToAgent yes\n    UseKeychain yes\n",
            constants::SSH_KEY_NAME
        );
        let contents = if config_path.exists() {
            let existing = fs::read_to_string(&config_path)?;
            if existing.contains("github.com") {
                return Ok(());
            }
            format!("{existing}\n{block}")
        } else {
            block
        };
        let to_io = |e: anyhow::Error| GenesisError::Io(std::io::Error::other(e.to_string()));
        genesis_fs::atomic_write(
            &config_path,
            contents.as_bytes(),
            constants::SECRET_FILE_MODE,
        )
        .map_err(to_io)?;
        Ok(())
    }

    fn existing_ssh(&self) -> Result<(), GenesisError> {
        let key_path = self.ssh_key_path();
        if key_path.exists() {
            return Err(GenesisError::AlreadyProvisioned {
                what: "ssh keypair".to_string(),
                path: key_path,
            });
        }
        Ok(())
    }

    fn ssh_material(&self) -> Result<KeyMaterial, GenesisError> {
        let public_part = fs::read_to_string(self.ssh_pub_path())?.trim().to_string();
        let fingerprint = ssh_fingerprint(&public_part)?;
        Ok(KeyMaterial {
            kind: KeyKind::Ssh,
            public_part,
            fingerprint,
            created_at: Utc::now(),
        })
    }
}

/// OpenSSH-style fingerprint: SHA-256 over the base64-decoded key blob,
/// rendered as `SHA256:` plus unpadded base64.
pub fn ssh_fingerprint(public_key_line: &str) -> Result<String, GenesisError> {
    let blob_b64 = public_key_line.split_whitespace().nth(1).ok_or_else(|| {
        GenesisError::Integrity("ssh public key line is malformed".to_string())
    })?;
    let blob = STANDARD
        .decode(blob_b64)
        .map_err(|e| GenesisError::Integrity(format!("ssh public key is not base64: {e}")))?;
    let digest = Sha256::digest(&blob);
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}
