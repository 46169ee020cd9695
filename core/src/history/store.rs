use std::sync::Arc;

use crate::error::{EngineError, StoreError};
use crate::store::{put_json, Store};
use crate::task::StepId;

use super::record::ExecutionRecord;

const PREFIX: &str = "executions";
const ADHOC: &str = "_adhoc";

/// Append-only log of execution attempts on top of a [`Store`].
///
/// Keys embed zero-padded step and attempt numbers so a prefix scan returns one
/// step's attempts in order.
#[derive(Clone)]
pub struct ExecutionHistory {
    store: Arc<dyn Store>,
}

impl ExecutionHistory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn key_for(record: &ExecutionRecord) -> String {
        match (&record.task_id, record.step_id) {
            (Some(task), Some(step)) => format!(
                "{PREFIX}/{task}/{:06}/{:06}-{}",
                step.0, record.attempt, record.id
            ),
            _ => format!(
                "{PREFIX}/{ADHOC}/{:020}-{}",
                record.created_at.timestamp_millis().max(0),
                record.id
            ),
        }
    }

    pub async fn append(&self, record: &ExecutionRecord) -> Result<(), EngineError> {
        let key = Self::key_for(record);
        put_json(self.store.as_ref(), &key, record).await?;
        tracing::debug!(
            target: "autopilot.flow",
            key = %key,
            success = record.success,
            attempt = record.attempt,
            "execution recorded"
        );
        Ok(())
    }

    pub async fn for_step(
        &self,
        task_id: &str,
        step: StepId,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        self.scan(&format!("{PREFIX}/{task_id}/{:06}/", step.0)).await
    }

    pub async fn for_task(&self, task_id: &str) -> Result<Vec<ExecutionRecord>, EngineError> {
        self.scan(&format!("{PREFIX}/{task_id}/")).await
    }

    /// Most recent ad-hoc executions, newest last.
    pub async fn adhoc(&self, limit: usize) -> Result<Vec<ExecutionRecord>, EngineError> {
        let mut all = self.scan(&format!("{PREFIX}/{ADHOC}/")).await?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<ExecutionRecord>, EngineError> {
        let entries = self.store.list_by_prefix(prefix).await?;
        entries
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value(value).map_err(|e| {
                    EngineError::Store(StoreError::Codec {
                        key,
                        message: e.to_string(),
                    })
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ErrorClass;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn record(task: Option<&str>, step: Option<usize>, attempt: u32) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::new_v4(),
            task_id: task.map(str::to_string),
            step_id: step.map(StepId),
            attempt,
            language: "python".into(),
            code: "print(1)".into(),
            stdout: String::new(),
            stderr: "ValueError: boom".into(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: Some(1),
            duration_ms: 3,
            success: false,
            error: Some(ErrorClass {
                kind: ErrorKind::Runtime,
                message: "boom".into(),
                exception: Some("ValueError".into()),
            }),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn step_records_come_back_in_attempt_order() {
        let history = ExecutionHistory::new(Arc::new(MemoryStore::new()));
        for attempt in [2, 10, 1] {
            history
                .append(&record(Some("t1"), Some(0), attempt))
                .await
                .unwrap();
        }
        history.append(&record(Some("t1"), Some(1), 1)).await.unwrap();

        let attempts: Vec<u32> = history
            .for_step("t1", StepId(0))
            .await
            .unwrap()
            .iter()
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 10]);
        assert_eq!(history.for_task("t1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_store_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let history = ExecutionHistory::new(store);
        let err = history.append(&record(None, None, 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[test]
    fn failure_summary_names_exception() {
        let r = record(None, None, 1);
        assert_eq!(r.failure_summary(), "runtime (ValueError): boom");
    }
}
