use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::completion::Purpose;
use crate::error::StoreError;
use crate::store::{get_json, put_json, Store};
use crate::task::StepId;

use super::detect::TruncationReason;

const PREFIX: &str = "checkpoints/";

/// Everything needed to resume a truncated generation without the original future.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub seq: u64,
    #[serde(default)]
    pub step_id: Option<StepId>,
    pub purpose: Purpose,
    /// The request prompt the generation started from.
    pub prompt: String,
    /// Compressed working memory at the time of truncation.
    pub context: String,
    /// Tail of the output produced so far.
    pub partial_tail: String,
    pub produced_chars: usize,
    pub reason: TruncationReason,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub task_id: String,
    pub step_id: Option<StepId>,
    pub purpose: Purpose,
    pub prompt: String,
    pub context: String,
    pub partial_tail: String,
    pub produced_chars: usize,
    pub reason: TruncationReason,
    pub attempt: u32,
}

/// Checkpoints keyed `checkpoints/{task}/{seq:010}` in the backing store.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn Store>,
    /// Serializes seq allocation so concurrent steps of one task never share a number.
    seq_lock: Arc<Mutex<()>>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            seq_lock: Arc::new(Mutex::new(())),
        }
    }

    fn task_prefix(task_id: &str) -> String {
        format!("{PREFIX}{task_id}/")
    }

    fn key(task_id: &str, seq: u64) -> String {
        format!("{PREFIX}{task_id}/{seq:010}")
    }

    /// Persist a checkpoint with `seq = latest + 1`. Returns once the store has it.
    pub async fn write(&self, new: NewCheckpoint) -> Result<Checkpoint, StoreError> {
        let _guard = self.seq_lock.lock().await;
        let seq = self
            .latest(&new.task_id)
            .await?
            .map(|c| c.seq + 1)
            .unwrap_or(1);

        let checkpoint = Checkpoint {
            task_id: new.task_id,
            seq,
            step_id: new.step_id,
            purpose: new.purpose,
            prompt: new.prompt,
            context: new.context,
            partial_tail: new.partial_tail,
            produced_chars: new.produced_chars,
            reason: new.reason,
            attempt: new.attempt,
            created_at: Utc::now(),
        };
        put_json(
            self.store.as_ref(),
            &Self::key(&checkpoint.task_id, seq),
            &checkpoint,
        )
        .await?;

        tracing::info!(
            target: "autopilot.flow",
            task_id = %checkpoint.task_id,
            seq,
            reason = %checkpoint.reason,
            "checkpoint written"
        );
        Ok(checkpoint)
    }

    pub async fn get(&self, task_id: &str, seq: u64) -> Result<Option<Checkpoint>, StoreError> {
        get_json(self.store.as_ref(), &Self::key(task_id, seq)).await
    }

    /// All checkpoints of a task, ascending by seq.
    pub async fn list(&self, task_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let entries = self
            .store
            .list_by_prefix(&Self::task_prefix(task_id))
            .await?;
        entries
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value(value).map_err(|e| StoreError::Codec {
                    key,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    pub async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.list(task_id).await?.pop())
    }

    /// Task ids that currently hold at least one checkpoint.
    pub async fn tasks(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: BTreeMap<String, ()> = BTreeMap::new();
        for (key, _) in self.store.list_by_prefix(PREFIX).await? {
            if let Some((task, _)) = key[PREFIX.len()..].split_once('/') {
                ids.insert(task.to_string(), ());
            }
        }
        Ok(ids.into_keys().collect())
    }

    /// Drop checkpoints older than `retention` and all but the newest `keep_last`.
    /// The newest checkpoint always survives age-based removal. Returns the number deleted.
    pub async fn gc(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
        retention: std::time::Duration,
        keep_last: usize,
    ) -> Result<usize, StoreError> {
        let all = self.list(task_id).await?;
        let retention =
            ChronoDuration::from_std(retention).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let keep_from = all.len().saturating_sub(keep_last.max(1));

        let mut removed = 0;
        for (i, cp) in all.iter().enumerate() {
            let newest = i + 1 == all.len();
            let expired = now.signed_duration_since(cp.created_at) > retention;
            if newest || (i >= keep_from && !expired) {
                continue;
            }
            if self.store.delete(&Self::key(task_id, cp.seq)).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(task_id, removed, "checkpoints collected");
        }
        Ok(removed)
    }

    /// Remove every checkpoint of a task that reached a terminal state.
    pub async fn retire(&self, task_id: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (key, _) in self
            .store
            .list_by_prefix(&Self::task_prefix(task_id))
            .await?
        {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn new_cp(task: &str, tail: &str) -> NewCheckpoint {
        NewCheckpoint {
            task_id: task.to_string(),
            step_id: Some(StepId(0)),
            purpose: Purpose::StepCode,
            prompt: "write code".into(),
            context: "ctx".into(),
            partial_tail: tail.to_string(),
            produced_chars: tail.len(),
            reason: TruncationReason::FinishLength,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn sequences_increase_per_task() {
        let cps = CheckpointStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(cps.write(new_cp("t1", "a")).await.unwrap().seq, 1);
        assert_eq!(cps.write(new_cp("t1", "b")).await.unwrap().seq, 2);
        assert_eq!(cps.write(new_cp("t2", "c")).await.unwrap().seq, 1);

        let latest = cps.latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.partial_tail, "b");
        assert_eq!(cps.tasks().await.unwrap(), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn concurrent_writes_get_distinct_seqs() {
        let cps = CheckpointStore::new(Arc::new(MemoryStore::new()));
        let (a, b) = tokio::join!(cps.write(new_cp("t", "a")), cps.write(new_cp("t", "b")));
        let mut seqs = vec![a.unwrap().seq, b.unwrap().seq];
        seqs.sort();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn gc_keeps_last_n_and_newest() {
        let cps = CheckpointStore::new(Arc::new(MemoryStore::new()));
        for i in 0..5 {
            cps.write(new_cp("t", &i.to_string())).await.unwrap();
        }
        let removed = cps
            .gc("t", Utc::now(), std::time::Duration::from_secs(3600), 2)
            .await
            .unwrap();
        assert_eq!(removed, 3);
        let left: Vec<u64> = cps.list("t").await.unwrap().iter().map(|c| c.seq).collect();
        assert_eq!(left, vec![4, 5]);

        // Everything is expired an hour from now, except the newest.
        let later = Utc::now() + ChronoDuration::hours(2);
        cps.gc("t", later, std::time::Duration::from_secs(60), 5)
            .await
            .unwrap();
        let left: Vec<u64> = cps.list("t").await.unwrap().iter().map(|c| c.seq).collect();
        assert_eq!(left, vec![5]);
    }

    #[tokio::test]
    async fn retire_removes_everything_for_task() {
        let cps = CheckpointStore::new(Arc::new(MemoryStore::new()));
        cps.write(new_cp("t", "a")).await.unwrap();
        cps.write(new_cp("t", "b")).await.unwrap();
        cps.write(new_cp("u", "c")).await.unwrap();
        assert_eq!(cps.retire("t").await.unwrap(), 2);
        assert!(cps.latest("t").await.unwrap().is_none());
        assert!(cps.latest("u").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn outage_surfaces_as_store_error() {
        let store = Arc::new(MemoryStore::new());
        let cps = CheckpointStore::new(store.clone());
        store.set_offline(true);
        let err = cps.write(new_cp("t", "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
