//! `status` subcommand: ledger state per stage.

use crate::cli::CliContext;
use crate::core::ledger::Ledger;
use crate::core::stages::STAGE_ORDER;
use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Table};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub fn run(ctx: &CliContext, args: StatusArgs) -> Result<()> {
    let ledger = Ledger::open(&ctx.paths.ledger_path, &ctx.paths.ledger_lock)?;

    if args.json {
        let json = serde_json::to_string_pretty(ledger.records()).context("serialize ledger")?;
        println!("{json}");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Stage").add_attribute(Attribute::Bold),
        Cell::new("Status").add_attribute(Attribute::Bold),
        Cell::new("Attempts").add_attribute(Attribute::Bold),
        Cell::new("Updated").add_attribute(Attribute::Bold),
        Cell::new("Last error").add_attribute(Attribute::Bold),
    ]);

    for name in STAGE_ORDER {
        match ledger.record(name) {
            Some(record) => {
                table.add_row(vec![
                    record.name.clone(),
                    record.status.to_string(),
                    record.attempts.to_string(),
                    record.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    record.last_error.clone().unwrap_or_else(|| "-".to_string()),
                ]);
            }
            None => {
                table.add_row(vec![
                    name.to_string(),
                    "pending".to_string(),
                    "0".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                ]);
            }
        }
    }

    println!("{table}");
    Ok(())
}
