//! Plans tasks, dispatches ready steps and drives them to a terminal state.

mod handle;
#[allow(clippy::module_inception)]
mod orchestrator;
mod outcome;
mod prompts;

pub use handle::{snapshot_key, TaskHandle, TaskLedger};
pub use orchestrator::Orchestrator;
pub use outcome::{FailureDiagnostic, TaskOutcome};
pub use prompts::{plan_prompt, step_prompt};
