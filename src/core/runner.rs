//! Sequential stage execution with idempotency gates and a durable ledger.
//!
//! The runner owns every status transition. Stages report typed results;
//! the runner alone decides to halt, and it halts on the first failure
//! because later stages depend on earlier ones (credentials before the
//! configuration that references them).

use crate::core::ledger::{Ledger, StageStatus};
use crate::errors::GenesisError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One named, idempotent unit of provisioning work.
pub trait Stage {
    fn name(&self) -> &str;

    /// Idempotency gate: true means the work is already done on this host
    /// and the stage is marked Skipped without running.
    fn is_complete(&self, ctx: &StageContext) -> Result<bool, GenesisError>;

    fn run(&self, ctx: &StageContext) -> Result<(), GenesisError>;
}

/// Source of yes/no decisions, threaded through stage construction so
/// business logic never prompts directly.
pub trait Confirmation {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Answers yes to everything (`--yes` / automation).
pub struct AlwaysYes;

impl Confirmation for AlwaysYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Prompts on the terminal; declines on a closed stdin.
pub struct Interactive;

impl Confirmation for Interactive {
    fn confirm(&self, prompt: &str) -> bool {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
            .unwrap_or(false)
    }
}

/// Cooperative cancellation flag, set by the Ctrl-C handler and observed
/// between stages. A stage mid-call finishes that call first.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Read-only context handed to every stage.
pub struct StageContext {
    pub assume_yes: bool,
    pub verbose: bool,
    confirm: Box<dyn Confirmation>,
}

impl StageContext {
    pub fn new(assume_yes: bool, verbose: bool, confirm: Box<dyn Confirmation>) -> Self {
        Self {
            assume_yes,
            verbose,
            confirm,
        }
    }

    /// Auto-confirm mode short-circuits without touching the terminal.
    pub fn confirm(&self, prompt: &str) -> bool {
        self.assume_yes || self.confirm.confirm(prompt)
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub name: String,
    pub status: StageStatus,
    pub error: Option<String>,
    pub remediation: Option<String>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<StageOutcome>,
    /// Name of the stage whose failure halted the sequence.
    pub halted_at: Option<String>,
    pub cancelled: bool,
}

impl RunReport {
    /// True when every stage ended Succeeded or Skipped.
    pub fn success(&self) -> bool {
        self.halted_at.is_none() && !self.cancelled
    }
}

/// Drives an ordered stage list against the ledger.
pub struct StageRunner {
    ledger: Ledger,
    cancel: CancelFlag,
}

impl StageRunner {
    pub fn new(ledger: Ledger, cancel: CancelFlag) -> Self {
        Self { ledger, cancel }
    }

    pub fn execute(
        &mut self,
        stages: &[Box<dyn Stage>],
        ctx: &StageContext,
    ) -> Result<RunReport, GenesisError> {
        let mut report = RunReport::default();

        for stage in stages {
            let name = stage.name().to_string();

            if self.cancel.is_cancelled() {
                info!(stage = %name, "cancellation observed; not starting further stages");
                report.cancelled = true;
                break;
            }

            // Resume: never re-run a stage that already reached a done
            // status in a previous invocation.
            if let Some(record) = self.ledger.record(&name) {
                if record.status.is_done() {
                    debug!(stage = %name, status = %record.status, "already done; resuming past it");
                    report.outcomes.push(StageOutcome {
                        name,
                        status: record.status,
                        error: None,
                        remediation: None,
                    });
                    continue;
                }
            }

            match stage.is_complete(ctx) {
                Ok(true) => {
                    self.ledger.mark(&name, StageStatus::Skipped, None)?;
                    report.outcomes.push(StageOutcome {
                        name,
                        status: StageStatus::Skipped,
                        error: None,
                        remediation: None,
                    });
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    self.record_failure(&mut report, &name, &e)?;
                    break;
                }
            }

            self.ledger.mark(&name, StageStatus::Running, None)?;
            match stage.run(ctx) {
                Ok(()) => {
                    self.ledger.mark(&name, StageStatus::Succeeded, None)?;
                    report.outcomes.push(StageOutcome {
                        name,
                        status: StageStatus::Succeeded,
                        error: None,
                        remediation: None,
                    });
                }
                Err(e) => {
                    self.record_failure(&mut report, &name, &e)?;
                    break;
                }
            }
        }

        Ok(report)
    }

    fn record_failure(
        &mut self,
        report: &mut RunReport,
        name: &str,
        err: &GenesisError,
    ) -> Result<(), GenesisError> {
        let detail = format!("{}: {err}", err.kind());
        self.ledger
            .mark(name, StageStatus::Failed, Some(detail.clone()))?;
        report.outcomes.push(StageOutcome {
            name: name.to_string(),
            status: StageStatus::Failed,
            error: Some(detail),
            remediation: Some(err.remediation()),
        });
        report.halted_at = Some(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct FakeStage {
        name: String,
        complete: Arc<AtomicBool>,
        runs: Arc<AtomicUsize>,
        fail: bool,
        mark_complete_after_run: bool,
    }

    impl FakeStage {
        fn ok(name: &str) -> (Self, Arc<AtomicUsize>) {
            let runs = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    name: name.to_string(),
                    complete: Arc::new(AtomicBool::new(false)),
                    runs: Arc::clone(&runs),
                    fail: false,
                    mark_complete_after_run: true,
                },
                runs,
            )
        }

        fn failing(name: &str) -> Self {
            Self {
                name: name.to_string(),
                complete: Arc::new(AtomicBool::new(false)),
                runs: Arc::new(AtomicUsize::new(0)),
                fail: true,
                mark_complete_after_run: false,
            }
        }
    }

    impl Stage for FakeStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_complete(&self, _ctx: &StageContext) -> Result<bool, GenesisError> {
            Ok(self.complete.load(Ordering::SeqCst))
        }

        fn run(&self, _ctx: &StageContext) -> Result<(), GenesisError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GenesisError::ExternalTool {
                    tool: "fake".to_string(),
                    code: Some(1),
                    stderr: "boom".to_string(),
                });
            }
            if self.mark_complete_after_run {
                self.complete.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn ctx() -> StageContext {
        StageContext::new(true, false, Box::new(AlwaysYes))
    }

    fn runner(dir: &TempDir) -> StageRunner {
        let ledger = Ledger::open(
            &dir.path().join("ledger.toml"),
            &dir.path().join("ledger.lock"),
        )
        .unwrap();
        StageRunner::new(ledger, CancelFlag::new())
    }

    #[test]
    fn test_all_stages_run_in_order() {
        let dir = TempDir::new().unwrap();
        let (a, a_runs) = FakeStage::ok("a");
        let (b, b_runs) = FakeStage::ok("b");
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(a), Box::new(b)];

        let report = runner(&dir).execute(&stages, &ctx()).unwrap();
        assert!(report.success());
        assert_eq!(a_runs.load(Ordering::SeqCst), 1);
        assert_eq!(b_runs.load(Ordering::SeqCst), 1);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.status == StageStatus::Succeeded));
    }

    #[test]
    fn test_failure_halts_remaining_stages() {
        let dir = TempDir::new().unwrap();
        let (a, _) = FakeStage::ok("a");
        let (c, c_runs) = FakeStage::ok("c");
        let stages: Vec<Box<dyn Stage>> =
            vec![Box::new(a), Box::new(FakeStage::failing("b")), Box::new(c)];

        let report = runner(&dir).execute(&stages, &ctx()).unwrap();
        assert!(!report.success());
        assert_eq!(report.halted_at.as_deref(), Some("b"));
        assert_eq!(c_runs.load(Ordering::SeqCst), 0);
        let failed = report.outcomes.iter().find(|o| o.name == "b").unwrap();
        assert_eq!(failed.status, StageStatus::Failed);
        assert!(failed.error.as_deref().unwrap().starts_with("external-tool-failure"));
    }

    #[test]
    fn test_rerun_skips_succeeded_and_retries_failed() {
        let dir = TempDir::new().unwrap();
        let (a, a_runs) = FakeStage::ok("a");
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(a), Box::new(FakeStage::failing("b"))];
        let report = runner(&dir).execute(&stages, &ctx()).unwrap();
        assert!(!report.success());
        assert_eq!(a_runs.load(Ordering::SeqCst), 1);

        // Second invocation: "a" is not re-run; "b" is attempted again.
        let (a2, a2_runs) = FakeStage::ok("a");
        let b2 = FakeStage::failing("b");
        let b2_runs = Arc::clone(&b2.runs);
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(a2), Box::new(b2)];
        let report = runner(&dir).execute(&stages, &ctx()).unwrap();
        assert!(!report.success());
        assert_eq!(a2_runs.load(Ordering::SeqCst), 0);
        assert_eq!(b2_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_stage_marked_skipped_without_running() {
        let dir = TempDir::new().unwrap();
        let (a, a_runs) = FakeStage::ok("a");
        a.complete.store(true, Ordering::SeqCst);
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(a)];

        let report = runner(&dir).execute(&stages, &ctx()).unwrap();
        assert!(report.success());
        assert_eq!(a_runs.load(Ordering::SeqCst), 0);
        assert_eq!(report.outcomes[0].status, StageStatus::Skipped);
    }

    #[test]
    fn test_second_run_is_all_skipped() {
        // Idempotence: with no host change, the second run marks every
        // stage done and reports success.
        let dir = TempDir::new().unwrap();
        let (a, _) = FakeStage::ok("a");
        let (b, _) = FakeStage::ok("b");
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(a), Box::new(b)];
        assert!(runner(&dir).execute(&stages, &ctx()).unwrap().success());

        let (a2, a2_runs) = FakeStage::ok("a");
        let (b2, b2_runs) = FakeStage::ok("b");
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(a2), Box::new(b2)];
        let report = runner(&dir).execute(&stages, &ctx()).unwrap();
        assert!(report.success());
        assert_eq!(a2_runs.load(Ordering::SeqCst), 0);
        assert_eq!(b2_runs.load(Ordering::SeqCst), 0);
        assert!(report.outcomes.iter().all(|o| o.status.is_done()));
    }

    #[test]
    fn test_cancellation_stops_before_next_stage() {
        let dir = TempDir::new().unwrap();
        let cancel = CancelFlag::new();
        let ledger = Ledger::open(
            &dir.path().join("ledger.toml"),
            &dir.path().join("ledger.lock"),
        )
        .unwrap();
        let mut runner = StageRunner::new(ledger, cancel.clone());

        cancel.cancel();
        let (a, a_runs) = FakeStage::ok("a");
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(a)];
        let report = runner.execute(&stages, &ctx()).unwrap();
        assert!(report.cancelled);
        assert!(!report.success());
        assert_eq!(a_runs.load(Ordering::SeqCst), 0);
    }
}
