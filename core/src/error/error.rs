use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::plan::PlanError;
use crate::history::ExecutionRecord;
use crate::safety::Violation;
use crate::task::TransitionError;

/// Stable, serializable error classification shared by records, events and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPlan,
    UnsupportedLanguage,
    SafetyRejected,
    HealingExhausted,
    ContinuationExhausted,
    StoreUnavailable,
    Completion,
    Cancelled,
    Timeout,
    Runtime,
    NonZeroExit,
    SpawnFailed,
    NotFound,
    Transition,
    Config,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidPlan => "invalid_plan",
            ErrorKind::UnsupportedLanguage => "unsupported_language",
            ErrorKind::SafetyRejected => "safety_rejected",
            ErrorKind::HealingExhausted => "healing_exhausted",
            ErrorKind::ContinuationExhausted => "continuation_exhausted",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Completion => "completion",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Runtime => "runtime",
            ErrorKind::NonZeroExit => "non_zero_exit",
            ErrorKind::SpawnFailed => "spawn_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transition => "transition",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        }
    }

    /// Transient kinds are worth another attempt; structural ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Runtime
                | ErrorKind::NonZeroExit
                | ErrorKind::SpawnFailed
                | ErrorKind::Completion
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store value for '{key}' could not be decoded: {message}")]
    Codec { key: String, message: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("code rejected by safety validator: {}", summarize_violations(.violations))]
    SafetyRejected { violations: Vec<Violation> },

    #[error("self-healing exhausted for step {step} after {attempts} attempt(s)")]
    HealingExhausted {
        step: String,
        attempts: u32,
        last_record: Box<ExecutionRecord>,
    },

    #[error("continuation exhausted for task {task_id} after {attempts} attempt(s): {reason}")]
    ContinuationExhausted {
        task_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("completion service error: {0}")]
    Completion(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("config error: {0}")]
    Config(String),

    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidPlan(_) => ErrorKind::InvalidPlan,
            EngineError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            EngineError::SafetyRejected { .. } => ErrorKind::SafetyRejected,
            EngineError::HealingExhausted { .. } => ErrorKind::HealingExhausted,
            EngineError::ContinuationExhausted { .. } => ErrorKind::ContinuationExhausted,
            EngineError::Store(_) => ErrorKind::StoreUnavailable,
            EngineError::Completion(_) => ErrorKind::Completion,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::TaskNotFound(_) | EngineError::StepNotFound(_) => ErrorKind::NotFound,
            EngineError::Transition(_) => ErrorKind::Transition,
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn last_record(&self) -> Option<&ExecutionRecord> {
        match self {
            EngineError::HealingExhausted { last_record, .. } => Some(last_record),
            _ => None,
        }
    }
}

fn summarize_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("engine failed: {0}")]
    Engine(#[from] EngineError),
    #[error("task {task_id} finished as {status}")]
    TaskFailed { task_id: String, status: String },
    #[error("command failed: {0}")]
    Command(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}
