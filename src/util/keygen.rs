//! Key generation backends (`ssh-keygen`, `gpg`).

use crate::constants;
use crate::errors::GenesisError;
use crate::models::settings::Identity;
use crate::util::command;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

fn tool_timeout() -> Duration {
    Duration::from_secs(constants::COMMAND_TIMEOUT_SECS)
}

/// Generation and export operations the credential provisioner needs.
/// Behind a trait so provisioning logic is testable without real key
/// material or a gpg homedir.
pub trait KeyGenerator {
    /// Generate an ed25519 SSH keypair at `path` with no passphrase.
    fn ssh_generate(&self, path: &Path, comment: &str) -> Result<(), GenesisError>;

    /// Generate a GPG signing key for `identity`, returning its fingerprint.
    fn gpg_generate(&self, identity: &Identity) -> Result<String, GenesisError>;

    /// Fingerprint of an existing secret key matching the identity's email,
    /// if one is present in the keyring.
    fn gpg_existing_fingerprint(&self, email: &str) -> Result<Option<String>, GenesisError>;

    /// ASCII-armored public key export.
    fn gpg_export_public(&self, fingerprint: &str) -> Result<String, GenesisError>;

    /// ASCII-armored secret key export. Callers must seal this immediately;
    /// it never touches disk unencrypted.
    fn gpg_export_secret(&self, fingerprint: &str) -> Result<Zeroizing<Vec<u8>>, GenesisError>;
}

/// Shells out to the real tools.
pub struct ShellKeyGenerator;

impl KeyGenerator for ShellKeyGenerator {
    fn ssh_generate(&self, path: &Path, comment: &str) -> Result<(), GenesisError> {
        let mut cmd = Command::new("ssh-keygen");
        cmd.arg("-t")
            .arg("ed25519")
            .arg("-C")
            .arg(comment)
            .arg("-f")
            .arg(path)
            .arg("-N")
            .arg("");
        command::run_checked(cmd, "ssh-keygen", tool_timeout())
    }

    fn gpg_generate(&self, identity: &Identity) -> Result<String, GenesisError> {
        let batch = format!(
            "Key-Type: RSA\n\
             Key-Length: 4096\n\
             Subkey-Type: RSA\n\
             Subkey-Length: 4096\n\
             Name-Real: {name}\n\
             Name-Email: {email}\n\
             Expire-Date: {expiry}\n\
             %no-protection\n\
             %commit\n",
            name = identity.git_name,
            email = identity.git_email,
            expiry = constants::GPG_EXPIRY,
        );
        let mut batch_file = tempfile::NamedTempFile::new()?;
        batch_file.write_all(batch.as_bytes())?;
        batch_file.flush()?;

        let mut cmd = Command::new("gpg");
        cmd.arg("--batch").arg("--generate-key").arg(batch_file.path());
        command::run_checked(cmd, "gpg", tool_timeout())?;
        debug!(email = %identity.git_email, "gpg key generated");

        self.gpg_existing_fingerprint(&identity.git_email)?
            .ok_or_else(|| {
                GenesisError::Integrity(
                    "gpg reported success but the new key is not in the keyring".to_string(),
                )
            })
    }

    fn gpg_existing_fingerprint(&self, email: &str) -> Result<Option<String>, GenesisError> {
        let mut cmd = Command::new("gpg");
        cmd.arg("--list-secret-keys")
            .arg("--with-colons")
            .arg(email);
        let output = command::output_with_timeout(cmd, "gpg", tool_timeout())?;
        // Nonzero exit means no matching key.
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_first_fingerprint(&stdout))
    }

    fn gpg_export_public(&self, fingerprint: &str) -> Result<String, GenesisError> {
        let mut cmd = Command::new("gpg");
        cmd.arg("--armor").arg("--export").arg(fingerprint);
        let out = command::output_checked(cmd, "gpg", tool_timeout())?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn gpg_export_secret(&self, fingerprint: &str) -> Result<Zeroizing<Vec<u8>>, GenesisError> {
        let mut cmd = Command::new("gpg");
        cmd.arg("--batch")
            .arg("--armor")
            .arg("--export-secret-keys")
            .arg(fingerprint);
        let out = command::output_checked(cmd, "gpg", tool_timeout())?;
        Ok(Zeroizing::new(out))
    }
}

/// First `fpr` record in `--with-colons` output. Field 10 holds the
/// fingerprint.
fn parse_first_fingerprint(colons: &str) -> Option<String> {
    colons
        .lines()
        .filter(|line| line.starts_with("fpr:"))
        .filter_map(|line| line.split(':').nth(9))
        .find(|fpr| !fpr.is_empty())
        .map(str::to_string)
}
