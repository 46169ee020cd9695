use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::completion::{first_code_block, Backoff, CompletionRequest, Purpose};
use crate::config::AppConfig;
use crate::context::Services;
use crate::continuation::{Checkpoint, CheckpointStore, ContinuationManager, DetachedHost};
use crate::error::EngineError;
use crate::events::{EventJournal, EventKind};
use crate::healing::{fence_names, HealingRequest, SelfHealingLoop, StandaloneLedger};
use crate::history::{ExecutionHistory, ExecutionRecord};
use crate::memory::MemoryManager;
use crate::sandbox::{effective_timeout, LanguageRegistry};
use crate::store::{get_json, put_json};
use crate::task::{
    parse_plan, PlannedStep, SkipReason, StepId, StepStatus, Task, TaskStateMachine, TaskStatus,
};
use crate::util::head_tail;

use super::handle::{planning_key, snapshot_key, TaskHandle, TaskLedger};
use super::outcome::{FailureDiagnostic, TaskOutcome};
use super::prompts::{plan_prompt, step_prompt};

const SUMMARY_OUTPUT_CHARS: usize = 400;

/// Written before planning starts and removed once the task is registered, so a crash
/// mid-plan leaves enough behind to plan again.
#[derive(Debug, Serialize, Deserialize)]
struct PendingPlan {
    description: String,
}

enum StepResult {
    Executed(ExecutionRecord),
    /// The model answered in prose; nothing ran.
    Answered(String),
}

/// Entry point of the engine. Cheap to clone; clones share all task state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: AppConfig,
    services: Services,
    journal: EventJournal,
    history: ExecutionHistory,
    continuation: ContinuationManager,
    healing: SelfHealingLoop,
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
    finished: Mutex<HashSet<String>>,
    workspace_root: PathBuf,
    languages: Vec<String>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, services: Services, journal: EventJournal) -> Self {
        let history = ExecutionHistory::new(services.store.clone());
        let backoff = Backoff::new(config.completion.retry.clone());
        let continuation = ContinuationManager::new(
            services.completion.clone(),
            CheckpointStore::new(services.store.clone()),
            journal.clone(),
            backoff.clone(),
            config.continuation.clone(),
            config.memory.target_budget(),
        );
        let healing = SelfHealingLoop::new(
            services.sandbox.clone(),
            services.validator.clone(),
            services.completion.clone(),
            history.clone(),
            backoff,
            effective_timeout(Some(config.sandbox.timeout_secs)),
        )
        .with_journal(journal.clone());

        let workspace_root = config
            .sandbox
            .workspace_root
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("autopilot-workspaces"));
        let languages = LanguageRegistry::with_overrides(&config.sandbox.languages)
            .languages()
            .map(|l| l.name.clone())
            .filter(|l| services.sandbox.supports(l))
            .collect();

        Self {
            inner: Arc::new(Inner {
                config,
                services,
                journal,
                history,
                continuation,
                healing,
                tasks: RwLock::new(HashMap::new()),
                finished: Mutex::new(HashSet::new()),
                workspace_root,
                languages,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn journal(&self) -> &EventJournal {
        &self.inner.journal
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.inner.history
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        self.inner.continuation.checkpoints()
    }

    /// Plan `description` with the completion service and register the task.
    pub async fn submit(&self, description: &str) -> Result<Task, EngineError> {
        let task_id = Uuid::new_v4().to_string();
        put_json(
            self.inner.services.store.as_ref(),
            &planning_key(&task_id),
            &PendingPlan {
                description: description.to_string(),
            },
        )
        .await?;
        let memory = self.seed_memory(description);
        let planned = self.plan_steps(&task_id, description, &memory, None).await;
        self.conclude_planning(task_id, description, planned, memory)
            .await
    }

    /// Register a task from an existing plan, skipping the planner.
    pub async fn submit_planned(
        &self,
        description: &str,
        planned: Vec<PlannedStep>,
    ) -> Result<Task, EngineError> {
        let memory = self.seed_memory(description);
        self.register(Uuid::new_v4().to_string(), description, planned, memory)
            .await
    }

    /// Submit and run to completion.
    pub async fn run_task(&self, description: &str) -> Result<TaskOutcome, EngineError> {
        let task = self.submit(description).await?;
        self.run(&task.id).await
    }

    pub async fn task(&self, task_id: &str) -> Result<Task, EngineError> {
        let live = self.inner.tasks.read().await.get(task_id).cloned();
        if let Some(handle) = live {
            return Ok(handle.snapshot().await);
        }
        get_json(self.inner.services.store.as_ref(), &snapshot_key(task_id))
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// Every persisted task, in key order.
    pub async fn tasks(&self) -> Result<Vec<Task>, EngineError> {
        let entries = self
            .inner
            .services
            .store
            .list_by_prefix(&snapshot_key(""))
            .await?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_value::<Task>(value) {
                Ok(task) => out.push(task),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable task snapshot")
                }
            }
        }
        Ok(out)
    }

    /// Drive the task until it reaches a terminal state.
    pub async fn run(&self, task_id: &str) -> Result<TaskOutcome, EngineError> {
        let handle = self.handle(task_id).await?;
        {
            let mut m = handle.machine().lock().await;
            if m.is_terminal() {
                return Ok(TaskOutcome {
                    task: m.task().clone(),
                    diagnostics: Vec::new(),
                });
            }
            m.start()?;
        }
        handle.persist().await?;
        self.inner
            .journal
            .publish(task_id, EventKind::TaskStarted)
            .await;

        let semaphore = Arc::new(Semaphore::new(
            self.inner.config.task.max_parallel_steps.max(1),
        ));
        let mut in_flight: HashSet<StepId> = HashSet::new();
        let mut announced: HashSet<StepId> = {
            let m = handle.machine().lock().await;
            m.task()
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Skipped)
                .map(|s| s.id)
                .collect()
        };
        let mut diagnostics = Vec::new();
        let mut join: JoinSet<(StepId, Result<StepResult, EngineError>)> = JoinSet::new();

        loop {
            let ready = {
                let mut m = handle.machine().lock().await;
                if m.is_terminal() {
                    break;
                }
                m.advance()
            };
            for id in ready {
                if in_flight.insert(id) {
                    let this = self.clone();
                    let handle = handle.clone();
                    let semaphore = semaphore.clone();
                    join.spawn(async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            return (id, Err(EngineError::Cancelled));
                        };
                        let result = this.execute_step(&handle, id).await;
                        (id, result)
                    });
                }
            }
            if join.is_empty() {
                break;
            }

            match join.join_next().await {
                Some(Ok((id, result))) => {
                    in_flight.remove(&id);
                    self.settle_step(&handle, id, result, &mut diagnostics).await;
                }
                Some(Err(e)) => tracing::error!(task_id, error = %e, "step worker crashed"),
                None => break,
            }
            self.announce_skips(&handle, &mut announced).await;
            handle.persist().await?;
        }

        // Cancelled or failed fast: stop in-flight workers and let them wind down.
        if !join.is_empty() {
            handle.stop_steps();
        }
        while let Some(joined) = join.join_next().await {
            if let Ok((id, result)) = joined {
                self.settle_step(&handle, id, result, &mut diagnostics).await;
            }
        }

        let task = {
            let mut m = handle.machine().lock().await;
            if !m.is_terminal() {
                tracing::warn!(task_id, status = %m.status(), "no runnable steps left, failing task");
                m.abort()?;
            }
            m.task().clone()
        };
        self.announce_skips(&handle, &mut announced).await;
        handle.persist().await?;
        self.finish(&handle, task.status).await?;

        tracing::info!(
            task_id,
            status = %task.status,
            failures = diagnostics.len(),
            "task finished"
        );
        Ok(TaskOutcome { task, diagnostics })
    }

    /// Stop the task: in-flight processes are killed and pending steps skipped.
    pub async fn cancel(&self, task_id: &str) -> Result<(), EngineError> {
        let handle = self.handle(task_id).await?;
        handle.cancel_token().cancel();
        let skipped: Vec<StepId> = {
            let mut m = handle.machine().lock().await;
            if m.is_terminal() {
                return Ok(());
            }
            let live = m
                .task()
                .steps
                .iter()
                .filter(|s| !s.status.is_terminal())
                .map(|s| s.id)
                .collect();
            m.cancel()?;
            live
        };
        handle.persist().await?;
        for step in skipped {
            self.inner
                .journal
                .publish(
                    task_id,
                    EventKind::StepSkipped {
                        step,
                        reason: SkipReason::Cancelled,
                    },
                )
                .await;
        }
        tracing::info!(task_id, "task cancelled");
        self.finish(&handle, TaskStatus::Cancelled).await
    }

    /// Reload a persisted task and its latest checkpoint, then keep running it.
    ///
    /// Generations cut off mid-step continue from their last checkpoint instead of
    /// starting over. A task that crashed while planning is planned again, from its
    /// planning checkpoint when one exists.
    pub async fn resume(&self, task_id: &str) -> Result<TaskOutcome, EngineError> {
        let snapshot: Option<Task> =
            get_json(self.inner.services.store.as_ref(), &snapshot_key(task_id)).await?;
        let Some(task) = snapshot else {
            return self.resume_planning(task_id).await;
        };
        let mut machine = TaskStateMachine::from_task(task, self.inner.config.task.failure_policy)?;
        if machine.is_terminal() {
            return Ok(TaskOutcome {
                task: machine.into_task(),
                diagnostics: Vec::new(),
            });
        }
        let reset = machine.reset_interrupted();

        let checkpoints = self.checkpoints().list(task_id).await?;
        let checkpoint = checkpoints.last().cloned();
        let resume_points = interrupted_generations(machine.task(), checkpoints);
        let completed: Vec<(StepId, String, String)> = machine
            .task()
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| {
                let output = s.artifacts.output.as_deref().unwrap_or("");
                (
                    s.id,
                    format!("step {}", s.key),
                    step_summary(&s.description, output),
                )
            })
            .collect();
        let memory = self.seed_memory(&machine.task().description);

        let workdir = self.inner.workspace_root.join(task_id);
        tokio::fs::create_dir_all(&workdir).await?;
        let handle = Arc::new(TaskHandle::new(
            machine,
            memory,
            self.inner.services.store.clone(),
            workdir,
        ));
        for (id, label, summary) in completed {
            handle.remember_summary(id, summary, &label).await;
        }
        if let Some(cp) = &checkpoint {
            handle
                .memory()
                .lock()
                .await
                .ingest(Some("checkpoint context"), cp.context.clone());
        }
        let resumed_steps = resume_points.len();
        handle.set_resume_points(resume_points).await;
        handle.persist().await?;
        self.inner
            .tasks
            .write()
            .await
            .insert(task_id.to_string(), handle);
        self.inner.finished.lock().await.remove(task_id);

        let seq = checkpoint.as_ref().map(|c| c.seq);
        self.inner
            .journal
            .publish(task_id, EventKind::TaskResumed { checkpoint: seq })
            .await;
        tracing::info!(
            task_id,
            checkpoint = ?seq,
            reset_steps = reset.len(),
            resumed_steps,
            "task resumed"
        );
        self.run(task_id).await
    }

    async fn resume_planning(&self, task_id: &str) -> Result<TaskOutcome, EngineError> {
        let pending: PendingPlan =
            get_json(self.inner.services.store.as_ref(), &planning_key(task_id))
                .await?
                .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let checkpoint = self
            .checkpoints()
            .list(task_id)
            .await?
            .into_iter()
            .rev()
            .find(|c| c.step_id.is_none() && c.purpose == Purpose::Plan);

        let seq = checkpoint.as_ref().map(|c| c.seq);
        self.inner
            .journal
            .publish(task_id, EventKind::TaskResumed { checkpoint: seq })
            .await;
        tracing::info!(task_id, checkpoint = ?seq, "planning resumed");

        let memory = self.seed_memory(&pending.description);
        let planned = self
            .plan_steps(task_id, &pending.description, &memory, checkpoint.as_ref())
            .await;
        self.conclude_planning(task_id.to_string(), &pending.description, planned, memory)
            .await?;
        self.run(task_id).await
    }

    /// Run one snippet outside any task, with self-healing.
    pub async fn exec(
        &self,
        request: HealingRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionRecord, EngineError> {
        let ledger = StandaloneLedger::new(self.inner.config.healing.max_retries);
        self.inner
            .healing
            .execute_with_healing(&ledger, request, cancel)
            .await
    }

    /// Apply checkpoint retention to every task.
    pub async fn collect_checkpoints(&self) -> Result<usize, EngineError> {
        self.inner.continuation.gc_all().await
    }

    async fn handle(&self, task_id: &str) -> Result<Arc<TaskHandle>, EngineError> {
        self.inner
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    fn seed_memory(&self, description: &str) -> Arc<Mutex<MemoryManager>> {
        let mut memory = MemoryManager::from_config(&self.inner.config.memory);
        memory.ingest_pinned(Some("goal"), description);
        Arc::new(Mutex::new(memory))
    }

    async fn plan_steps(
        &self,
        task_id: &str,
        description: &str,
        memory: &Arc<Mutex<MemoryManager>>,
        from: Option<&Checkpoint>,
    ) -> Result<Vec<PlannedStep>, EngineError> {
        let host = DetachedHost::new(task_id, memory.clone());
        let continuation = &self.inner.continuation;
        let cancel = CancellationToken::new();
        let generation = match from {
            Some(checkpoint) => continuation.resume_from(&host, checkpoint, &cancel).await?,
            None => {
                let request = CompletionRequest::new(
                    Purpose::Plan,
                    plan_prompt(description, &self.inner.languages),
                )
                .for_task(task_id, None);
                continuation.generate(&host, None, request, &cancel).await?
            }
        };
        Ok(parse_plan(&generation.text)?)
    }

    /// Register the planned task, or clean up after a failed plan. Either way the
    /// pending-plan record is gone afterwards.
    async fn conclude_planning(
        &self,
        task_id: String,
        description: &str,
        planned: Result<Vec<PlannedStep>, EngineError>,
        memory: Arc<Mutex<MemoryManager>>,
    ) -> Result<Task, EngineError> {
        let registered = match planned {
            Ok(planned) => {
                self.register(task_id.clone(), description, planned, memory)
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &registered {
            tracing::error!(
                task_id = %task_id,
                error.kind = %err.kind(),
                error.message = %err,
                "planning failed"
            );
            self.checkpoints().retire(&task_id).await?;
        }
        self.inner
            .services
            .store
            .delete(&planning_key(&task_id))
            .await?;
        registered
    }

    async fn register(
        &self,
        task_id: String,
        description: &str,
        planned: Vec<PlannedStep>,
        memory: Arc<Mutex<MemoryManager>>,
    ) -> Result<Task, EngineError> {
        let machine = TaskStateMachine::plan_as(
            task_id.clone(),
            description,
            planned,
            self.inner.config.healing.max_retries,
            self.inner.config.task.failure_policy,
        )?;
        let steps = machine.task().steps.len();

        let workdir = self.inner.workspace_root.join(&task_id);
        tokio::fs::create_dir_all(&workdir).await?;
        let handle = Arc::new(TaskHandle::new(
            machine,
            memory,
            self.inner.services.store.clone(),
            workdir,
        ));
        handle.persist().await?;
        self.inner
            .tasks
            .write()
            .await
            .insert(task_id.clone(), handle.clone());
        self.inner
            .journal
            .publish(&task_id, EventKind::TaskPlanned { steps })
            .await;
        Ok(handle.snapshot().await)
    }

    async fn execute_step(
        &self,
        handle: &Arc<TaskHandle>,
        id: StepId,
    ) -> Result<StepResult, EngineError> {
        let (task, step) = {
            let m = handle.machine().lock().await;
            (m.task().clone(), m.step(id)?.clone())
        };
        let default_language = step
            .language
            .clone()
            .unwrap_or_else(|| self.inner.config.task.default_language.clone());

        let cancel = handle.step_token();
        let (language, code) = match step.code.clone() {
            Some(code) => (default_language, code),
            None => {
                let continuation = &self.inner.continuation;
                let generation = match handle.take_resume_point(id).await {
                    Some(checkpoint) => {
                        continuation
                            .resume_from(handle.as_ref(), &checkpoint, cancel)
                            .await?
                    }
                    None => {
                        handle.revisit(&step.dependencies).await;
                        let context = handle
                            .memory()
                            .lock()
                            .await
                            .compress(self.inner.config.memory.target_budget());
                        let request = CompletionRequest::new(
                            Purpose::StepCode,
                            step_prompt(&task, &step, &default_language),
                        )
                        .with_context(context)
                        .for_task(handle.id(), Some(id));
                        continuation
                            .generate(handle.as_ref(), Some(id), request, cancel)
                            .await?
                    }
                };

                let names = fence_names(&default_language);
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                match first_code_block(&generation.text, Some(&names)) {
                    Some(block) => {
                        let language = block
                            .language
                            .filter(|l| {
                                !names.contains(&l.as_str())
                                    && self.inner.services.sandbox.supports(l)
                            })
                            .unwrap_or(default_language);
                        (language, block.code)
                    }
                    None => {
                        handle
                            .machine()
                            .lock()
                            .await
                            .complete_without_execution(id, generation.text.clone())?;
                        return Ok(StepResult::Answered(generation.text));
                    }
                }
            }
        };

        handle.machine().lock().await.set_code(id, code.clone())?;
        let request = HealingRequest::new(language, code)
            .with_goal(step.description.clone())
            .in_dir(handle.workdir());
        let ledger = TaskLedger::new(handle.clone(), id);
        self.inner
            .healing
            .execute_with_healing(&ledger, request, cancel)
            .await
            .map(StepResult::Executed)
    }

    async fn settle_step(
        &self,
        handle: &Arc<TaskHandle>,
        id: StepId,
        result: Result<StepResult, EngineError>,
        diagnostics: &mut Vec<FailureDiagnostic>,
    ) {
        let task_id = handle.id();
        match result {
            Ok(outcome) => {
                let (attempts, output) = match &outcome {
                    StepResult::Executed(record) => (record.attempt, record.stdout.as_str()),
                    StepResult::Answered(text) => (0, text.as_str()),
                };
                let (key, description) = {
                    let m = handle.machine().lock().await;
                    match m.step(id) {
                        Ok(s) => (s.key.clone(), s.description.clone()),
                        Err(_) => (id.to_string(), String::new()),
                    }
                };
                let summary = step_summary(&description, output);
                handle
                    .remember_summary(id, summary, &format!("step {key}"))
                    .await;
                self.inner
                    .journal
                    .publish(task_id, EventKind::StepCompleted { step: id, attempts })
                    .await;
            }
            Err(EngineError::Cancelled) => {}
            Err(err) => {
                let key = {
                    let mut m = handle.machine().lock().await;
                    if m.status() == TaskStatus::Cancelled {
                        return;
                    }
                    // Skipped under a running worker, e.g. by a fail-fast sibling.
                    if m.step(id).map(|s| s.status == StepStatus::Skipped).unwrap_or(false) {
                        tracing::debug!(task_id, step = %id, error = %err, "skipped step wound down");
                        return;
                    }
                    let key = m.step(id).map(|s| s.key.clone()).ok();
                    let step_live = m.step(id).map(|s| !s.status.is_terminal()).unwrap_or(false);
                    if step_live && !m.is_terminal() {
                        if let Err(e) = m.fail_step(id, err.kind(), err.to_string()) {
                            tracing::warn!(task_id, step = %id, error = %e, "could not fail step");
                        }
                    }
                    if matches!(err, EngineError::ContinuationExhausted { .. }) {
                        if let Err(e) = m.abort() {
                            tracing::warn!(task_id, error = %e, "could not abort task");
                        }
                    }
                    key
                };
                tracing::warn!(
                    task_id,
                    step = %id,
                    error.kind = %err.kind(),
                    error.message = %err,
                    "step failed"
                );
                self.inner
                    .journal
                    .publish(
                        task_id,
                        EventKind::StepFailed {
                            step: id,
                            error_kind: err.kind(),
                            message: err.to_string(),
                        },
                    )
                    .await;
                diagnostics.push(FailureDiagnostic::from_error(Some(id), key, &err));
            }
        }
    }

    async fn announce_skips(&self, handle: &TaskHandle, announced: &mut HashSet<StepId>) {
        let fresh: Vec<(StepId, SkipReason)> = {
            let m = handle.machine().lock().await;
            m.task()
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Skipped && !announced.contains(&s.id))
                .map(|s| (s.id, s.skip_reason.unwrap_or(SkipReason::Requested)))
                .collect()
        };
        for (step, reason) in fresh {
            announced.insert(step);
            self.inner
                .journal
                .publish(handle.id(), EventKind::StepSkipped { step, reason })
                .await;
        }
    }

    /// Publish the terminal event and drop the task's checkpoints, once per task.
    async fn finish(&self, handle: &TaskHandle, status: TaskStatus) -> Result<(), EngineError> {
        if !self
            .inner
            .finished
            .lock()
            .await
            .insert(handle.id().to_string())
        {
            return Ok(());
        }
        self.inner
            .journal
            .publish(handle.id(), EventKind::TaskFinished { status })
            .await;
        let retired = self.checkpoints().retire(handle.id()).await?;
        if retired > 0 {
            tracing::debug!(task_id = handle.id(), retired, "checkpoints retired");
        }
        Ok(())
    }
}

/// Latest checkpoint of each step whose generation never finished.
fn interrupted_generations(
    task: &Task,
    checkpoints: Vec<Checkpoint>,
) -> HashMap<StepId, Checkpoint> {
    let mut points = HashMap::new();
    for checkpoint in checkpoints {
        let Some(step) = checkpoint.step_id.and_then(|id| task.steps.get(id.0)) else {
            continue;
        };
        if step.status.is_terminal() || step.code.is_some() || step.artifacts.code.is_some() {
            continue;
        }
        // Ascending seq: later checkpoints replace earlier ones.
        points.insert(step.id, checkpoint);
    }
    points
}

fn step_summary(description: &str, output: &str) -> String {
    let output = head_tail(
        output.trim(),
        SUMMARY_OUTPUT_CHARS,
        SUMMARY_OUTPUT_CHARS,
        "\n...\n",
    );
    if output.is_empty() {
        format!("{description}\n(no output)")
    } else {
        format!("{description}\noutput:\n{output}")
    }
}
