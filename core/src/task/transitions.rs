//! Legal status transitions for tasks and steps.

use thiserror::Error;

use super::types::{StepId, StepStatus, TaskStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid step transition for {step} from {from:?} to {to:?}")]
    InvalidStep {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },
    #[error("invalid task transition from {from:?} to {to:?}")]
    InvalidTask { from: TaskStatus, to: TaskStatus },
    #[error("task is in terminal state {state:?}")]
    TaskTerminal { state: TaskStatus },
    #[error("step {step} has unmet dependencies")]
    DependenciesUnmet { step: StepId },
    #[error("step {step} has no attempts left ({attempts}/{max})")]
    AttemptsExhausted { step: StepId, attempts: u32, max: u32 },
}

pub struct StepTransition;

impl StepTransition {
    pub fn validate(step: StepId, from: StepStatus, to: StepStatus) -> Result<(), TransitionError> {
        use StepStatus::*;

        let is_valid = match (from, to) {
            _ if from.is_terminal() => false,
            (Pending, Ready) => true,
            // Retries re-enter Running straight from Pending.
            (Pending | Ready, Running) => true,
            (Ready, Completed) | (Running, Completed) => true,
            (Pending | Ready | Running, Failed) => true,
            (Running, Pending) => true,
            (Pending | Ready | Running, Skipped) => true,
            _ => false,
        };

        if is_valid {
            Ok(())
        } else {
            Err(TransitionError::InvalidStep { step, from, to })
        }
    }
}

pub struct TaskTransition;

impl TaskTransition {
    pub fn validate(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
        use TaskStatus::*;

        if from.is_terminal() {
            return Err(TransitionError::TaskTerminal { state: from });
        }

        let is_valid = matches!(
            (from, to),
            (Planned, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Planned | Running | Paused, Completed | Failed | Cancelled)
        );

        if is_valid {
            Ok(())
        } else {
            Err(TransitionError::InvalidTask { from, to })
        }
    }
}
