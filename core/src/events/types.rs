use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::task::{SkipReason, StepId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskPlanned {
        steps: usize,
    },
    TaskStarted,
    StepStarted {
        step: StepId,
        attempt: u32,
    },
    StepRetrying {
        step: StepId,
        attempt: u32,
        error_kind: Option<ErrorKind>,
    },
    StepCompleted {
        step: StepId,
        attempts: u32,
    },
    StepFailed {
        step: StepId,
        error_kind: ErrorKind,
        message: String,
    },
    StepSkipped {
        step: StepId,
        reason: SkipReason,
    },
    CheckpointWritten {
        seq: u64,
        reason: String,
    },
    TaskPaused {
        reason: String,
    },
    TaskResumed {
        checkpoint: Option<u64>,
    },
    TaskFinished {
        status: TaskStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}
