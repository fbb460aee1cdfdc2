//! Durable stage ledger enabling resumable reruns.
//!
//! The ledger is the single shared mutable resource of a run. Every status
//! transition is persisted immediately (flock + same-directory temp file +
//! atomic rename) so a crash mid-run leaves a durable resume point, and a
//! torn write is impossible. An unparseable ledger is treated as absent.

use crate::errors::GenesisError;
use crate::util::fs as genesis_fs;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Succeeded and Skipped both count as "done" for resume purposes.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    stages: Vec<StageRecord>,
}

/// Stage ledger bound to its file. Transitions are owned exclusively by the
/// stage runner; everything else reads.
pub struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
    file: LedgerFile,
}

impl Ledger {
    /// Open the ledger at `path`, creating an empty one in memory when the
    /// file is missing or unparseable.
    pub fn open(path: &Path, lock_path: &Path) -> Result<Self, GenesisError> {
        let file = if path.exists() {
            let content = fs::read_to_string(path)?;
            match toml::from_str(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ledger unparseable; starting fresh");
                    LedgerFile::default()
                }
            }
        } else {
            LedgerFile::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
            file,
        })
    }

    pub fn record(&self, name: &str) -> Option<&StageRecord> {
        self.file.stages.iter().find(|r| r.name == name)
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.file.stages
    }

    /// Transition a stage and persist the whole ledger. A transition to
    /// `Running` counts as a new attempt.
    pub fn mark(
        &mut self,
        name: &str,
        status: StageStatus,
        last_error: Option<String>,
    ) -> Result<(), GenesisError> {
        let now = Utc::now();
        match self.file.stages.iter_mut().find(|r| r.name == name) {
            Some(record) => {
                record.status = status;
                if status == StageStatus::Running {
                    record.attempts += 1;
                }
                record.last_error = last_error;
                record.updated_at = now;
            }
            None => {
                self.file.stages.push(StageRecord {
                    name: name.to_string(),
                    status,
                    attempts: u32::from(status == StageStatus::Running),
                    last_error,
                    updated_at: now,
                });
            }
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), GenesisError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = LedgerLock::acquire(&self.lock_path)?;
        let content = toml::to_string_pretty(&self.file)
            .map_err(|e| GenesisError::InvalidSettings(format!("serialize ledger: {e}")))?;
        genesis_fs::atomic_write(&self.path, content.as_bytes(), 0o600)
            .map_err(|e| GenesisError::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }
}

/// Exclusive flock held for the duration of a ledger write. Released when
/// the file handle drops.
struct LedgerLock {
    _file: File,
}

impl LedgerLock {
    fn acquire(path: &Path) -> Result<Self, GenesisError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}
