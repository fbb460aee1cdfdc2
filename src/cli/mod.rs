//! CLI routing and command dispatch.

use crate::core::paths::GenesisPaths;
use crate::models::settings::SettingsDocument;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod detect;
pub mod generate;
pub mod run;
pub mod status;

/// Shared context passed to all command handlers.
pub struct CliContext {
    pub paths: GenesisPaths,
    pub assume_yes: bool,
    pub verbose: bool,
    pub settings: SettingsDocument,
    pub settings_warning: Option<String>,
}

#[derive(Parser, Debug)]
#[command(
    name = "nix-mac-genesis",
    version,
    about = "Declarative macOS development machine provisioning"
)]
pub struct Cli {
    /// Answer yes to every prompt (suitable for automation)
    #[arg(short = 'y', long, global = true, env = "GENESIS_ASSUME_YES")]
    pub yes: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Alternate settings file (e.g. a private configuration checkout)
    #[arg(long, global = true, value_name = "PATH", env = "GENESIS_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Override the home directory all paths derive from
    #[arg(long, global = true, value_name = "PATH", env = "GENESIS_HOME")]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let paths = GenesisPaths::resolve(self.home, self.settings)?;

        // A missing settings file falls back to the embedded defaults; the
        // handlers surface the note so an operator knows which source ran.
        let settings_warning = (!paths.settings_path.exists()).then(|| {
            format!(
                "no settings at {}; using embedded defaults",
                paths.settings_path.display()
            )
        });
        let settings = SettingsDocument::load(&paths.settings_path)?;

        let ctx = CliContext {
            paths,
            assume_yes: self.yes,
            verbose: self.verbose,
            settings,
            settings_warning,
        };

        match self.command {
            Commands::Run(args) => run::run(&ctx, args),
            Commands::Generate(args) => generate::run(&ctx, args),
            Commands::Detect(args) => detect::run(&ctx, args),
            Commands::Status(args) => status::run(&ctx, args),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute the full provisioning sequence
    Run(run::RunArgs),
    /// Synthesize the nix-darwin configuration bundle without applying it
    Generate(generate::GenerateArgs),
    /// Probe current host preferences and write them as TOML
    Detect(detect::DetectArgs),
    /// Show per-stage ledger status
    Status(status::StatusArgs),
}
