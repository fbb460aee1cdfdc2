//! Credential vault: passphrase-derived authenticated encryption for
//! private key material at rest.
//!
//! Sealed token layout: `NMG1 || salt(16) || nonce(24) || ciphertext`.
//! The label a secret is stored under is bound as associated data, so a
//! token pasted under a different label fails authentication instead of
//! decrypting silently.

use crate::constants;
use crate::errors::GenesisError;
use crate::util::fs as genesis_fs;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Deferred passphrase lookup. Stages that never seal or unseal anything
/// (an idempotent rerun where every gate reports complete) must not cost
/// the operator a prompt, so resolution happens on first use.
pub trait PassphraseSource {
    fn passphrase(&self) -> Result<Zeroizing<String>, GenesisError>;
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        salt,
        constants::KDF_ITERATIONS,
        key.as_mut(),
    );
    key
}

/// Seal `plaintext` under `passphrase`, binding `label` as associated data.
/// Every call draws a fresh salt and nonce, so sealing the same secret
/// twice yields different tokens.
pub fn seal(passphrase: &str, label: &str, plaintext: &[u8]) -> Result<Vec<u8>, GenesisError> {
    let mut salt = [0u8; constants::KDF_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: label.as_bytes(),
            },
        )
        .map_err(|_| GenesisError::Integrity("sealing failed".to_string()))?;

    let mut token =
        Vec::with_capacity(constants::SEAL_MAGIC.len() + salt.len() + nonce.len() + ciphertext.len());
    token.extend_from_slice(constants::SEAL_MAGIC);
    token.extend_from_slice(&salt);
    token.extend_from_slice(&nonce);
    token.extend_from_slice(&ciphertext);
    Ok(token)
}

/// Unseal a token produced by [`seal`]. Any tampering, a wrong passphrase,
/// or a label mismatch surfaces as a single `IntegrityError`; the cipher
/// does not distinguish the causes and neither do we.
pub fn unseal(
    passphrase: &str,
    label: &str,
    token: &[u8],
) -> Result<Zeroizing<Vec<u8>>, GenesisError> {
    let header_len = constants::SEAL_MAGIC.len() + constants::KDF_SALT_LEN + NONCE_LEN;
    if token.len() <= header_len {
        return Err(GenesisError::Integrity(
            "sealed token is truncated".to_string(),
        ));
    }
    let (magic, rest) = token.split_at(constants::SEAL_MAGIC.len());
    if magic != constants::SEAL_MAGIC.as_slice() {
        return Err(GenesisError::Integrity(
            "not a sealed token (bad magic)".to_string(),
        ));
    }
    let (salt, rest) = rest.split_at(constants::KDF_SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(passphrase, salt);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: label.as_bytes(),
            },
        )
        .map_err(|_| {
            GenesisError::Integrity(format!(
                "authentication failed for sealed secret '{label}'"
            ))
        })?;
    Ok(Zeroizing::new(plaintext))
}

/// Directory of sealed secrets, one file per label.
pub struct Vault {
    dir: PathBuf,
}

impl Vault {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn secret_path(&self, label: &str) -> PathBuf {
        self.dir
            .join(format!("{label}.{}", constants::SEALED_EXTENSION))
    }

    pub fn contains(&self, label: &str) -> bool {
        self.secret_path(label).exists()
    }

    /// Seal and persist a secret. The plaintext never touches disk; only
    /// the sealed token is written, owner-read-only.
    pub fn store(
        &self,
        label: &str,
        passphrase: &str,
        plaintext: &[u8],
    ) -> Result<(), GenesisError> {
        let to_io = |e: anyhow::Error| GenesisError::Io(std::io::Error::other(e.to_string()));
        genesis_fs::ensure_dir(&self.dir, constants::SECRET_DIR_MODE).map_err(to_io)?;
        let token = seal(passphrase, label, plaintext)?;
        let path = self.secret_path(label);
        genesis_fs::atomic_write(&path, &token, constants::SECRET_FILE_MODE).map_err(to_io)?;
        debug!(label, path = %path.display(), "sealed secret stored");
        Ok(())
    }

    pub fn load(&self, label: &str, passphrase: &str) -> Result<Zeroizing<Vec<u8>>, GenesisError> {
        let token = fs::read(self.secret_path(label))?;
        unseal(passphrase, label, &token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_unseal_roundtrip() {
        let token = seal("hunter2", "ssh-private", b"-----BEGIN KEY-----").unwrap();
        let plain = unseal("hunter2", "ssh-private", &token).unwrap();
        assert_eq!(plain.as_slice(), b"-----BEGIN KEY-----");
    }

    #[test]
    fn test_fresh_randomness_per_seal() {
        let a = seal("p", "l", b"same").unwrap();
        let b = seal("p", "l", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_label_fails_authentication() {
        let token = seal("p", "ssh-private", b"secret").unwrap();
        let err = unseal("p", "gpg-private", &token).unwrap_err();
        assert_eq!(err.kind(), "integrity-error");
    }

    #[test]
    fn test_wrong_passphrase_fails_authentication() {
        let token = seal("correct", "l", b"secret").unwrap();
        let err = unseal("incorrect", "l", &token).unwrap_err();
        assert_eq!(err.kind(), "integrity-error");
    }

    #[test]
    fn test_tampered_ciphertext_detected() {
        let mut token = seal("p", "l", b"secret").unwrap();
        let last = token.len() - 1;
        token[last] ^= 0x01;
        let err = unseal("p", "l", &token).unwrap_err();
        assert_eq!(err.kind(), "integrity-error");
    }

    #[test]
    fn test_truncated_token_rejected() {
        let token = seal("p", "l", b"secret").unwrap();
        let err = unseal("p", "l", &token[..20]).unwrap_err();
        assert_eq!(err.kind(), "integrity-error");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut token = seal("p", "l", b"secret").unwrap();
        token[0] = b'X';
        let err = unseal("p", "l", &token).unwrap_err();
        assert_eq!(err.kind(), "integrity-error");
    }

    #[cfg(unix)]
    #[test]
    fn test_store_writes_owner_only_token() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(&dir.path().join("vault"));
        vault.store("ssh-private", "p", b"material").unwrap();
        let path = dir.path().join("vault/ssh-private.sealed");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        // The file holds the token, never the plaintext.
        let on_disk = fs::read(&path).unwrap();
        assert!(!on_disk
            .windows(b"material".len())
            .any(|w| w == b"material"));
        let plain = vault.load("ssh-private", "p").unwrap();
        assert_eq!(plain.as_slice(), b"material");
    }

    #[test]
    fn test_contains_reflects_store() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(dir.path());
        assert!(!vault.contains("x"));
        vault.store("x", "p", b"v").unwrap();
        assert!(vault.contains("x"));
    }
}
