//! Typed error taxonomy shared by all provisioning components.
//!
//! Leaf components return these as plain `Result` values; the stage runner
//! is the single place that decides whether a failure halts the sequence.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenesisError {
    /// A key the synthesizer needs has neither a probed value nor a
    /// settings default. Always fatal for synthesis.
    #[error("missing configuration value for '{key}': no probed value and no default in settings")]
    MissingConfigValue { key: String },

    /// An external tool exceeded its allotted wall-clock budget.
    #[error("'{tool}' did not finish within {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// Sealed material failed authentication (tampered ciphertext, wrong
    /// label, or wrong passphrase).
    #[error("vault integrity check failed: {0}")]
    Integrity(String),

    /// An external tool exited nonzero.
    #[error("{tool} failed{}: {stderr}", code.map(|c| format!(" (exit {c})")).unwrap_or_default())]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Material already exists at its canonical location. Not a failure:
    /// callers catch this and reuse the existing material.
    #[error("{what} already provisioned at {path}")]
    AlreadyProvisioned { what: String, path: PathBuf },

    /// The settings document is malformed or carries a wrong-typed value.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GenesisError {
    /// Short kind tag for ledger records and stage summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingConfigValue { .. } => "missing-config-value",
            Self::Timeout { .. } => "timeout",
            Self::Integrity(_) => "integrity-error",
            Self::ExternalTool { .. } => "external-tool-failure",
            Self::AlreadyProvisioned { .. } => "already-provisioned",
            Self::InvalidSettings(_) => "invalid-settings",
            Self::Io(_) => "io",
        }
    }

    /// Operator-facing hint printed alongside a failed stage.
    pub fn remediation(&self) -> String {
        match self {
            Self::MissingConfigValue { key } => format!(
                "add a default for '{key}' to the settings file (or unset its 'detect' flag) and rerun"
            ),
            Self::Timeout { tool, .. } => {
                format!("check that '{tool}' is responsive, then rerun to retry this stage")
            }
            Self::Integrity(_) => {
                "the sealed blob does not match its label/passphrase; restore it or reprovision with --force"
                    .to_string()
            }
            Self::ExternalTool { tool, .. } => {
                format!("inspect the '{tool}' output above, resolve the failure, then rerun")
            }
            Self::AlreadyProvisioned { path, .. } => format!(
                "existing material at {} was kept; pass --force to overwrite it",
                path.display()
            ),
            Self::InvalidSettings(_) => {
                "fix the settings file; every value must match its expected scalar kind".to_string()
            }
            Self::Io(_) => "check filesystem permissions and rerun".to_string(),
        }
    }
}
