//! Run, diagnose, repair, re-run.

mod ledger;
mod repair;
mod runner;

pub use ledger::{AttemptLedger, StandaloneLedger};
pub use repair::{fence_names, repair_prompt};
pub use runner::{HealingRequest, SelfHealingLoop};
