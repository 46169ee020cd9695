use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::continuation::{Checkpoint, ContinuationHost};
use crate::error::EngineError;
use crate::healing::AttemptLedger;
use crate::history::ExecutionRecord;
use crate::memory::{BlockId, MemoryManager};
use crate::store::{put_json, Store};
use crate::task::{StepId, StepStatus, Task, TaskStateMachine};

const SNAPSHOT_PREFIX: &str = "tasks/";
const PLANNING_PREFIX: &str = "planning/";

pub fn snapshot_key(task_id: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{task_id}")
}

/// Key of the record a task holds while its plan is still being generated.
pub fn planning_key(task_id: &str) -> String {
    format!("{PLANNING_PREFIX}{task_id}")
}

/// Live state of one task. The machine mutex is the task's single writer.
pub struct TaskHandle {
    id: String,
    machine: Mutex<TaskStateMachine>,
    memory: Arc<Mutex<MemoryManager>>,
    /// Summary block each completed step left in working memory.
    summaries: Mutex<HashMap<StepId, BlockId>>,
    /// Checkpoints a resumed task picks its interrupted generations up from.
    resume_points: Mutex<HashMap<StepId, Checkpoint>>,
    cancel: CancellationToken,
    /// Child of `cancel`: stops running steps without cancelling the task.
    steps: CancellationToken,
    store: Arc<dyn Store>,
    workdir: PathBuf,
}

impl TaskHandle {
    pub fn new(
        machine: TaskStateMachine,
        memory: Arc<Mutex<MemoryManager>>,
        store: Arc<dyn Store>,
        workdir: PathBuf,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            id: machine.id().to_string(),
            machine: Mutex::new(machine),
            memory,
            summaries: Mutex::new(HashMap::new()),
            resume_points: Mutex::new(HashMap::new()),
            steps: cancel.child_token(),
            cancel,
            store,
            workdir,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn machine(&self) -> &Mutex<TaskStateMachine> {
        &self.machine
    }

    pub fn memory(&self) -> &Arc<Mutex<MemoryManager>> {
        &self.memory
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Token every step worker runs under. Cancelling the task cancels it too.
    pub fn step_token(&self) -> &CancellationToken {
        &self.steps
    }

    /// Stop the steps still running, e.g. once the task failed fast.
    pub fn stop_steps(&self) {
        self.steps.cancel();
    }

    /// Record the summary a step left in memory.
    pub async fn remember_summary(&self, step: StepId, text: String, label: &str) {
        let block = self.memory.lock().await.ingest(Some(label), text);
        self.summaries.lock().await.insert(step, block);
    }

    /// Mark the summaries of `steps` as revisited so compression keeps them longer.
    pub async fn revisit(&self, steps: &[StepId]) {
        let summaries = self.summaries.lock().await;
        let mut memory = self.memory.lock().await;
        for step in steps {
            if let Some(&block) = summaries.get(step) {
                memory.reference(block);
            }
        }
    }

    pub async fn set_resume_points(&self, points: HashMap<StepId, Checkpoint>) {
        *self.resume_points.lock().await = points;
    }

    /// The checkpoint to continue `step`'s generation from, consumed on first use.
    pub async fn take_resume_point(&self, step: StepId) -> Option<Checkpoint> {
        self.resume_points.lock().await.remove(&step)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub async fn snapshot(&self) -> Task {
        self.machine.lock().await.task().clone()
    }

    /// Write the current task state to the store.
    pub async fn persist(&self) -> Result<(), EngineError> {
        let task = self.snapshot().await;
        put_json(self.store.as_ref(), &snapshot_key(&self.id), &task).await?;
        Ok(())
    }
}

#[async_trait]
impl ContinuationHost for TaskHandle {
    fn session(&self) -> &str {
        &self.id
    }

    async fn remember(&self, label: &str, text: &str) {
        self.memory.lock().await.ingest(Some(label), text);
    }

    async fn compressed_context(&self, budget: usize) -> String {
        self.memory.lock().await.compress(budget)
    }

    async fn on_paused(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        self.machine.lock().await.pause()?;
        tracing::info!(task_id = %self.id, seq = checkpoint.seq, "task paused for continuation");
        self.persist().await
    }

    async fn on_resumed(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        self.machine.lock().await.start()?;
        tracing::info!(task_id = %self.id, seq = checkpoint.seq, "task resumed from checkpoint");
        self.persist().await
    }
}

/// Attempt ledger backed by the step's own counter inside the task machine.
pub struct TaskLedger {
    handle: Arc<TaskHandle>,
    step: StepId,
}

impl TaskLedger {
    pub fn new(handle: Arc<TaskHandle>, step: StepId) -> Self {
        Self { handle, step }
    }
}

#[async_trait]
impl AttemptLedger for TaskLedger {
    fn task_id(&self) -> Option<&str> {
        Some(self.handle.id())
    }

    fn step_id(&self) -> Option<StepId> {
        Some(self.step)
    }

    async fn begin_attempt(&self) -> Result<u32, EngineError> {
        let attempt = self.handle.machine.lock().await.begin_attempt(self.step)?;
        self.handle.persist().await?;
        Ok(attempt)
    }

    async fn record_outcome(&self, record: &ExecutionRecord) -> Result<StepStatus, EngineError> {
        let status = self
            .handle
            .machine
            .lock()
            .await
            .complete_step(self.step, record)?;
        self.handle.persist().await?;
        Ok(status)
    }

    async fn store_code(&self, code: &str) -> Result<(), EngineError> {
        self.handle.machine.lock().await.set_code(self.step, code)
    }
}
