//! Core orchestration logic.

pub mod ledger;
pub mod paths;
pub mod probe;
pub mod provision;
pub mod runner;
pub mod stages;
pub mod synth;
pub mod vault;
