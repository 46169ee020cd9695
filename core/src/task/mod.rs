//! Task model and the state machine that owns it.

mod graph;
mod machine;
mod plan;
mod transitions;
mod types;

pub use graph::StepGraph;
pub use machine::TaskStateMachine;
pub use plan::{extract_json, parse_plan, PlannedStep, StepRef};
pub use transitions::{StepTransition, TaskTransition, TransitionError};
pub use types::{
    SkipReason, Step, StepArtifacts, StepId, StepStatus, Task, TaskProgress, TaskStatus,
};
