//! macOS development machine provisioning orchestrator.
//!
//! Drives a fixed, resumable sequence of provisioning stages: system
//! preparation, Nix installation, SSH/GPG credential provisioning with
//! encrypted at-rest backups, GitHub registration, git identity, and a
//! generated nix-darwin configuration bundle applied through nix-darwin.
//!
//! ## Modules
//! - `cli`: Command-line handlers
//! - `core`: Orchestration logic (runner, ledger, probe, synth, vault)
//! - `models`: Data structures
//! - `util`: Filesystem and external tool wrappers

pub mod cli;
pub mod constants;
pub mod core;
pub mod errors;
pub mod models;
pub mod util;
