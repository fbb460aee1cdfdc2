//! Centralized constants for paths, permissions, and limits.

/// Ledger file name under the state directory.
pub const LEDGER_FILE: &str = "ledger.toml";

/// Lock file guarding ledger writes.
pub const LEDGER_LOCK: &str = "ledger.lock";

/// Directory holding sealed key material, relative to the state directory.
pub const VAULT_DIR: &str = "vault";

/// File extension for sealed blobs.
pub const SEALED_EXTENSION: &str = "sealed";

/// Marker recording a successful SSH key upload, under the state directory.
/// Its absence keeps the provisioning stage eligible to retry registration.
pub const SSH_REGISTERED_MARKER: &str = "ssh-key.registered";

/// Marker recording a successful GPG key upload.
pub const GPG_REGISTERED_MARKER: &str = "gpg-key.registered";

/// Permission mode for ~/.ssh and the vault directory.
pub const SECRET_DIR_MODE: u32 = 0o700;

/// Permission mode for private keys and sealed blobs.
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Permission mode for public keys.
pub const PUBLIC_FILE_MODE: u32 = 0o644;

/// Permission mode for generated configuration documents.
pub const CONFIG_FILE_MODE: u32 = 0o644;

/// Default wall-clock budget for quick external commands (defaults, git, gpg).
pub const COMMAND_TIMEOUT_SECS: u64 = 60;

/// Budget for the package-manager installer and the config applier.
pub const INSTALL_TIMEOUT_SECS: u64 = 1800;

/// Budget for the hosting CLI's interactive authentication handshake.
pub const AUTH_TIMEOUT_SECS: u64 = 600;

/// PBKDF2-HMAC-SHA256 iteration count for vault key derivation.
pub const KDF_ITERATIONS: u32 = 600_000;

/// Salt length in bytes for vault key derivation.
pub const KDF_SALT_LEN: usize = 16;

/// Magic prefix identifying a sealed token.
pub const SEAL_MAGIC: &[u8; 4] = b"NMG1";

/// Default SSH key file name (ed25519).
pub const SSH_KEY_NAME: &str = "id_ed25519";

/// GPG key expiry passed to batch generation.
pub const GPG_EXPIRY: &str = "2y";

/// Environment variable supplying the vault passphrase non-interactively.
pub const VAULT_PASSPHRASE_ENV: &str = "GENESIS_VAULT_PASSPHRASE";
