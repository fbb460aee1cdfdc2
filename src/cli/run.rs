//! `run` subcommand: execute the full provisioning sequence.

use crate::cli::CliContext;
use crate::constants;
use crate::core::ledger::Ledger;
use crate::core::runner::{AlwaysYes, CancelFlag, Confirmation, Interactive, StageContext, StageRunner};
use crate::core::stages::{self, StageDeps};
use crate::core::synth::HostInfo;
use crate::core::vault::{PassphraseSource, Vault};
use crate::errors::GenesisError;
use crate::models::settings::Identity;
use anyhow::{bail, Context, Result};
use clap::Args;
use std::cell::RefCell;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroizing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Regenerate credentials even when material already exists
    #[arg(long)]
    pub force: bool,

    /// Clone this repository into ~/.config/nix-darwin instead of
    /// synthesizing a configuration bundle
    #[arg(long, value_name = "URL")]
    pub private_repo: Option<String>,

    /// Clone this repository as ~/.password-store instead of initializing
    /// an empty store
    #[arg(long, value_name = "URL")]
    pub password_repo: Option<String>,
}

pub fn run(ctx: &CliContext, args: RunArgs) -> Result<()> {
    if let Some(note) = &ctx.settings_warning {
        warn!("{note}");
    }

    let identity = Identity::resolve(&ctx.settings.identity)?;
    let host = HostInfo::detect().context("detect hostname and user")?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\ninterrupt received; stopping after the current stage");
            cancel.cancel();
        })
        .context("install interrupt handler")?;
    }

    let deps = StageDeps {
        paths: Arc::new(ctx.paths.clone()),
        settings: Arc::new(ctx.settings.clone()),
        identity,
        passphrase: Arc::new(LazyPassphrase::new(
            ctx.assume_yes,
            ctx.paths.vault_dir.clone(),
        )),
        keygen: Arc::new(crate::util::keygen::ShellKeyGenerator),
        hosting: Arc::new(crate::util::hosting::GithubCli),
        installer: Arc::new(crate::util::installer::DeterminateInstaller),
        defaults: Arc::new(crate::util::defaults::DefaultsCommand),
        host,
        private_repo: args.private_repo,
        password_repo: args.password_repo,
        force: args.force,
    };
    let stage_list = stages::standard_stages(deps);

    let confirm: Box<dyn Confirmation> = if ctx.assume_yes {
        Box::new(AlwaysYes)
    } else {
        Box::new(Interactive)
    };
    let stage_ctx = StageContext::new(ctx.assume_yes, ctx.verbose, confirm);

    let ledger = Ledger::open(&ctx.paths.ledger_path, &ctx.paths.ledger_lock)?;
    let mut runner = StageRunner::new(ledger, cancel);
    let report = runner.execute(&stage_list, &stage_ctx)?;

    for outcome in &report.outcomes {
        println!("{:<20} {}", outcome.name, outcome.status);
    }

    if report.cancelled {
        bail!("run cancelled; rerun to resume from the last completed stage");
    }
    if let Some(stage) = &report.halted_at {
        let failed = report
            .outcomes
            .iter()
            .find(|o| o.name == *stage);
        if let Some(outcome) = failed {
            if let Some(error) = &outcome.error {
                eprintln!("\nstage '{stage}' failed: {error}");
            }
            if let Some(remediation) = &outcome.remediation {
                eprintln!("hint: {remediation}");
            }
        }
        bail!("provisioning halted at stage '{stage}'; rerun to resume");
    }

    println!("\nprovisioning complete");
    Ok(())
}

/// Vault passphrase, resolved on first seal/unseal and cached for the rest
/// of the run. Environment first, interactive prompt otherwise; with `--yes`
/// there is no terminal to ask on, so the variable is required. An
/// idempotent rerun whose stages all gate complete never triggers this.
struct LazyPassphrase {
    assume_yes: bool,
    vault_dir: PathBuf,
    cached: RefCell<Option<Zeroizing<String>>>,
}

impl LazyPassphrase {
    fn new(assume_yes: bool, vault_dir: PathBuf) -> Self {
        Self {
            assume_yes,
            vault_dir,
            cached: RefCell::new(None),
        }
    }

    fn resolve(&self) -> Result<Zeroizing<String>, GenesisError> {
        if let Ok(value) = env::var(constants::VAULT_PASSPHRASE_ENV) {
            if !value.is_empty() {
                return Ok(Zeroizing::new(value));
            }
        }
        if self.assume_yes {
            return Err(GenesisError::InvalidSettings(format!(
                "${} must be set when running with --yes",
                constants::VAULT_PASSPHRASE_ENV
            )));
        }
        let vault = Vault::new(&self.vault_dir);
        let mut prompt = dialoguer::Password::new().with_prompt("Vault passphrase");
        if !vault.contains(crate::core::provision::SSH_SECRET_LABEL) {
            prompt = prompt.with_confirmation("Confirm passphrase", "Passphrases do not match");
        }
        let value = prompt
            .interact()
            .map_err(|e| GenesisError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Zeroizing::new(value))
    }
}

impl PassphraseSource for LazyPassphrase {
    fn passphrase(&self) -> Result<Zeroizing<String>, GenesisError> {
        let mut cached = self.cached.borrow_mut();
        if let Some(value) = cached.as_ref() {
            return Ok(value.clone());
        }
        let value = self.resolve()?;
        *cached = Some(value.clone());
        Ok(value)
    }
}
