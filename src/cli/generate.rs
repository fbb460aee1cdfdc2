//! `generate` subcommand: synthesize the configuration bundle without applying it.

use crate::cli::CliContext;
use crate::core::paths::GenesisPaths;
use crate::core::probe;
use crate::core::synth::{self, HostInfo};
use crate::util::defaults::DefaultsCommand;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::warn;

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Write the bundle here instead of ~/.config/nix-darwin
    #[arg(long, value_name = "DIR")]
    pub out: Option<PathBuf>,
}

pub fn run(ctx: &CliContext, args: GenerateArgs) -> Result<()> {
    if let Some(note) = &ctx.settings_warning {
        warn!("{note}");
    }

    let snapshot = probe::probe(&DefaultsCommand, probe::standard_keys());
    let host = HostInfo::detect().context("detect hostname and user")?;
    let bundle = synth::synthesize(&ctx.settings, &snapshot, &host)?;

    // --out redirects the whole bundle by re-rooting the target paths.
    let paths = match args.out {
        Some(out) => {
            let mut paths = ctx.paths.clone();
            paths.modules_dir = out.join("modules");
            paths.config_dir = out;
            paths
        }
        None => ctx.paths.clone(),
    };
    write_and_report(&paths, &bundle)
}

fn write_and_report(paths: &GenesisPaths, bundle: &synth::GeneratedConfigBundle) -> Result<()> {
    synth::write_bundle(paths, bundle)?;
    for file in &bundle.files {
        println!("wrote {}", paths.config_dir.join(&file.name).display());
    }
    Ok(())
}
