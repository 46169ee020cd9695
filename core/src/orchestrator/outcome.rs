use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ErrorKind};
use crate::history::ExecutionRecord;
use crate::safety::Violation;
use crate::task::{StepId, Task, TaskStatus};

/// Why a step (or the task) failed, with the evidence needed to act on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDiagnostic {
    pub step: Option<StepId>,
    pub step_key: Option<String>,
    pub error_kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub last_record: Option<ExecutionRecord>,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

impl FailureDiagnostic {
    pub fn from_error(step: Option<StepId>, step_key: Option<String>, err: &EngineError) -> Self {
        let violations = match err {
            EngineError::SafetyRejected { violations } => violations.clone(),
            _ => Vec::new(),
        };
        let message = match err.last_record() {
            Some(record) => format!("{err}: {}", record.failure_summary()),
            None => err.to_string(),
        };
        Self {
            step,
            step_key,
            error_kind: err.kind(),
            message,
            last_record: err.last_record().cloned(),
            violations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: Task,
    pub diagnostics: Vec<FailureDiagnostic>,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn is_success(&self) -> bool {
        self.task.status == TaskStatus::Completed
    }
}
