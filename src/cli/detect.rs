//! `detect` subcommand: probe host preferences and emit them as TOML.

use crate::cli::CliContext;
use crate::constants;
use crate::core::probe;
use crate::models::settings::PrefValue;
use crate::util::defaults::DefaultsCommand;
use crate::util::fs as genesis_fs;
use anyhow::Result;
use clap::Args;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct DetectArgs {
    /// Write the snapshot here instead of stdout
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

pub fn run(_ctx: &CliContext, args: DetectArgs) -> Result<()> {
    let snapshot = probe::probe(&DefaultsCommand, probe::standard_keys());

    // Group "section.key" entries into TOML tables per section.
    let mut sections: BTreeMap<&str, BTreeMap<&str, PrefValue>> = BTreeMap::new();
    for (qualified, value) in snapshot.iter() {
        if let Some((section, key)) = qualified.split_once('.') {
            sections.entry(section).or_default().insert(key, value.clone());
        }
    }
    let rendered = toml::to_string_pretty(&sections)?;

    match args.output {
        Some(path) => {
            genesis_fs::atomic_write(&path, rendered.as_bytes(), constants::CONFIG_FILE_MODE)?;
            println!("wrote {} probed values to {}", snapshot.len(), path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
