use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::error::EngineError;
use crate::history::ExecutionRecord;
use crate::task::{StepId, StepStatus, TransitionError};

/// Owner of a step's attempt counter.
///
/// The healing loop never counts attempts itself; it asks the ledger, so the counter on
/// the step and the number of records written can never drift apart.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    fn task_id(&self) -> Option<&str>;
    fn step_id(&self) -> Option<StepId>;

    /// Start the next attempt and return its 1-based number.
    async fn begin_attempt(&self) -> Result<u32, EngineError>;

    /// Record the attempt's outcome. `Pending` means another attempt is allowed.
    async fn record_outcome(&self, record: &ExecutionRecord) -> Result<StepStatus, EngineError>;

    /// Remember repaired code for the next attempt.
    async fn store_code(&self, _code: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Ledger for executions that belong to no task, such as `autopilot exec`.
#[derive(Debug)]
pub struct StandaloneLedger {
    max_attempts: u32,
    attempts: AtomicU32,
}

impl StandaloneLedger {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttemptLedger for StandaloneLedger {
    fn task_id(&self) -> Option<&str> {
        None
    }

    fn step_id(&self) -> Option<StepId> {
        None
    }

    async fn begin_attempt(&self) -> Result<u32, EngineError> {
        let prev = self
            .attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_attempts).then_some(n + 1)
            })
            .map_err(|n| TransitionError::AttemptsExhausted {
                step: StepId(0),
                attempts: n,
                max: self.max_attempts,
            })?;
        Ok(prev + 1)
    }

    async fn record_outcome(&self, record: &ExecutionRecord) -> Result<StepStatus, EngineError> {
        Ok(if record.success {
            StepStatus::Completed
        } else if self.attempts() < self.max_attempts {
            StepStatus::Pending
        } else {
            StepStatus::Failed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standalone_ledger_counts_up_to_the_bound() {
        let ledger = StandaloneLedger::new(2);
        assert_eq!(ledger.begin_attempt().await.unwrap(), 1);
        assert_eq!(ledger.begin_attempt().await.unwrap(), 2);
        let err = ledger.begin_attempt().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Transition(TransitionError::AttemptsExhausted { attempts: 2, .. })
        ));
        assert_eq!(ledger.attempts(), 2);
    }
}
