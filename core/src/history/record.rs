use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::task::StepId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClass {
    pub kind: ErrorKind,
    pub message: String,
    /// Exception or error type name recovered from stderr, e.g. `ValueError`.
    #[serde(default)]
    pub exception: Option<String>,
}

/// Who an execution belongs to. Ad-hoc runs carry no task or step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLabels {
    pub task_id: Option<String>,
    pub step_id: Option<StepId>,
    pub attempt: u32,
}

/// One sandbox execution attempt. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task_id: Option<String>,
    pub step_id: Option<StepId>,
    pub attempt: u32,
    pub language: String,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    /// `None` when killed by a signal or cancelled; 124 after a timeout.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<ErrorClass>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Short text describing the failure, suitable for a repair prompt or a log line.
    pub fn failure_summary(&self) -> String {
        match &self.error {
            None if self.success => "succeeded".to_string(),
            None => format!("exit code {:?}", self.exit_code),
            Some(err) => match &err.exception {
                Some(name) => format!("{} ({}): {}", err.kind, name, err.message),
                None => format!("{}: {}", err.kind, err.message),
            },
        }
    }
}
