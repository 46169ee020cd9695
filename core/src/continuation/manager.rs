use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::completion::{
    complete_with_retry, Backoff, CompletionRequest, CompletionResponse, CompletionService,
    FinishReason, Purpose,
};
use crate::config::ContinuationConfig;
use crate::error::{EngineError, StoreError};
use crate::events::{EventJournal, EventKind};
use crate::memory::MemoryManager;
use crate::task::StepId;
use crate::util::tail_chars;

use super::checkpoint::{Checkpoint, CheckpointStore, NewCheckpoint};
use super::detect::{detect_truncation, TruncationReason};
use super::stall::StallDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Generating,
    Truncated,
    Compressing,
    Resuming,
}

/// The side of a generation that owns task state and working memory.
#[async_trait]
pub trait ContinuationHost: Send + Sync {
    /// Session the checkpoints and events belong to (the task id).
    fn session(&self) -> &str;

    async fn remember(&self, label: &str, text: &str);

    /// Working memory compressed to at most `budget` tokens where possible.
    async fn compressed_context(&self, budget: usize) -> String;

    /// The checkpoint is persisted; mark the task Paused.
    async fn on_paused(&self, checkpoint: &Checkpoint) -> Result<(), EngineError>;

    /// The resume request is about to go out; mark the task Running again.
    async fn on_resumed(&self, checkpoint: &Checkpoint) -> Result<(), EngineError>;
}

/// Host with its own memory and no task to pause, used for planning and ad-hoc runs.
pub struct DetachedHost {
    session: String,
    memory: Arc<Mutex<MemoryManager>>,
}

impl DetachedHost {
    pub fn new(session: impl Into<String>, memory: Arc<Mutex<MemoryManager>>) -> Self {
        Self {
            session: session.into(),
            memory,
        }
    }
}

#[async_trait]
impl ContinuationHost for DetachedHost {
    fn session(&self) -> &str {
        &self.session
    }

    async fn remember(&self, label: &str, text: &str) {
        self.memory.lock().await.ingest(Some(label), text);
    }

    async fn compressed_context(&self, budget: usize) -> String {
        self.memory.lock().await.compress(budget)
    }

    async fn on_paused(&self, _checkpoint: &Checkpoint) -> Result<(), EngineError> {
        Ok(())
    }

    async fn on_resumed(&self, _checkpoint: &Checkpoint) -> Result<(), EngineError> {
        Ok(())
    }
}

/// A finished generation, possibly stitched together from several continuations.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub finish_reason: FinishReason,
    pub continuations: u32,
    /// Checkpoint sequence numbers written along the way.
    pub checkpoints: Vec<u64>,
    pub phases: Vec<Phase>,
}

/// Drives Generating -> Truncated -> Compressing -> Resuming -> Generating until the
/// model produces a complete answer or the attempt bound is hit.
#[derive(Clone)]
pub struct ContinuationManager {
    completion: Arc<dyn CompletionService>,
    checkpoints: CheckpointStore,
    journal: EventJournal,
    backoff: Backoff,
    config: ContinuationConfig,
    context_budget: usize,
}

impl ContinuationManager {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        checkpoints: CheckpointStore,
        journal: EventJournal,
        backoff: Backoff,
        config: ContinuationConfig,
        context_budget: usize,
    ) -> Self {
        Self {
            completion,
            checkpoints,
            journal,
            backoff,
            config,
            context_budget,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn completion(&self) -> &Arc<dyn CompletionService> {
        &self.completion
    }

    pub async fn generate(
        &self,
        host: &dyn ContinuationHost,
        step: Option<StepId>,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Generation, EngineError> {
        let start = Progress {
            output: String::new(),
            continuations: 0,
            current: request.clone(),
            phases: vec![Phase::Generating],
        };
        self.drive(host, step, &request, start, cancel).await
    }

    /// Pick up a generation that was cut off in an earlier process. The first request
    /// is the checkpoint's resume request and the reply is stitched onto its
    /// `partial_tail`. Earlier continuations count against the attempt bound.
    pub async fn resume_from(
        &self,
        host: &dyn ContinuationHost,
        checkpoint: &Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<Generation, EngineError> {
        let origin = CompletionRequest::new(checkpoint.purpose, checkpoint.prompt.clone())
            .for_task(checkpoint.task_id.clone(), checkpoint.step_id);
        tracing::info!(
            task_id = %checkpoint.task_id,
            seq = checkpoint.seq,
            step = ?checkpoint.step_id,
            "resuming generation from checkpoint"
        );
        host.on_resumed(checkpoint).await?;
        let start = Progress {
            output: checkpoint.partial_tail.clone(),
            continuations: checkpoint.attempt,
            current: resume_request(checkpoint),
            phases: vec![Phase::Resuming, Phase::Generating],
        };
        self.drive(host, checkpoint.step_id, &origin, start, cancel)
            .await
    }

    async fn drive(
        &self,
        host: &dyn ContinuationHost,
        step: Option<StepId>,
        request: &CompletionRequest,
        start: Progress,
        cancel: &CancellationToken,
    ) -> Result<Generation, EngineError> {
        let session = host.session().to_string();
        let mut checkpoints = Vec::new();
        let mut stall = StallDetector::new(self.config.similarity_threshold);
        let Progress {
            mut output,
            mut continuations,
            mut current,
            mut phases,
        } = start;

        loop {
            let response =
                complete_with_retry(self.completion.as_ref(), &current, &self.backoff, cancel)
                    .await?;

            if continuations > 0 && stall.observe(&response.text) {
                tracing::warn!(
                    task_id = %session,
                    continuations,
                    "continuation stalled on repeated output"
                );
                return Err(EngineError::ContinuationExhausted {
                    task_id: session,
                    attempts: continuations,
                    reason: "model repeated itself while continuing".to_string(),
                });
            }
            output.push_str(&response.text);

            // Syntactic checks look at the stitched output: a fence opened in one chunk
            // may be closed in the next.
            let combined = CompletionResponse {
                text: output.clone(),
                finish_reason: response.finish_reason.clone(),
                truncated: response.truncated,
            };
            let Some(reason) = detect_truncation(&combined) else {
                return Ok(Generation {
                    text: output,
                    finish_reason: response.finish_reason,
                    continuations,
                    checkpoints,
                    phases,
                });
            };

            if continuations >= self.config.max_attempts {
                tracing::error!(
                    task_id = %session,
                    attempts = continuations,
                    reason = %reason,
                    error.kind = "continuation_exhausted",
                    "continuation attempts exhausted"
                );
                return Err(EngineError::ContinuationExhausted {
                    task_id: session,
                    attempts: continuations,
                    reason: format!("still truncated ({reason})"),
                });
            }
            continuations += 1;

            phases.push(Phase::Truncated);
            let checkpoint = self
                .checkpoint(host, step, request, &output, reason, continuations)
                .await?;
            checkpoints.push(checkpoint.seq);

            phases.push(Phase::Compressing);
            // Resume from what the store holds, never from local state.
            let checkpoint = self
                .checkpoints
                .get(&session, checkpoint.seq)
                .await?
                .ok_or_else(|| {
                    StoreError::Unavailable(format!(
                        "checkpoint {} of task {session} missing after write",
                        checkpoint.seq
                    ))
                })?;

            phases.push(Phase::Resuming);
            current = resume_request(&checkpoint);
            host.on_resumed(&checkpoint).await?;
            self.journal
                .publish(
                    &session,
                    EventKind::TaskResumed {
                        checkpoint: Some(checkpoint.seq),
                    },
                )
                .await;
            phases.push(Phase::Generating);
        }
    }

    async fn checkpoint(
        &self,
        host: &dyn ContinuationHost,
        step: Option<StepId>,
        request: &CompletionRequest,
        output: &str,
        reason: TruncationReason,
        attempt: u32,
    ) -> Result<Checkpoint, EngineError> {
        let session = host.session().to_string();
        let tail = tail_chars(output, self.config.tail_chars).to_string();
        host.remember("partial output", &tail).await;
        let context = host.compressed_context(self.context_budget).await;

        let checkpoint = self
            .checkpoints
            .write(NewCheckpoint {
                task_id: session.clone(),
                step_id: step,
                purpose: request.purpose,
                prompt: request.prompt.clone(),
                context,
                partial_tail: tail,
                produced_chars: output.chars().count(),
                reason,
                attempt,
            })
            .await?;

        self.journal
            .publish(
                &session,
                EventKind::CheckpointWritten {
                    seq: checkpoint.seq,
                    reason: reason.to_string(),
                },
            )
            .await;
        host.on_paused(&checkpoint).await?;
        self.journal
            .publish(
                &session,
                EventKind::TaskPaused {
                    reason: reason.to_string(),
                },
            )
            .await;
        Ok(checkpoint)
    }

    /// Apply the retention window and keep-last bound to every task's checkpoints.
    pub async fn gc_all(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let retention = std::time::Duration::from_secs(self.config.retention_secs);
        let mut removed = 0;
        for task in self.checkpoints.tasks().await? {
            removed += self
                .checkpoints
                .gc(&task, now, retention, self.config.keep_last)
                .await?;
        }
        Ok(removed)
    }
}

/// Where a generation loop starts: fresh, or from a persisted checkpoint.
struct Progress {
    output: String,
    continuations: u32,
    current: CompletionRequest,
    phases: Vec<Phase>,
}

/// The request that continues the generation `checkpoint` captured.
pub fn resume_request(checkpoint: &Checkpoint) -> CompletionRequest {
    let prompt = format!(
        "Your previous reply was cut off ({reason}). Continue exactly where it stopped, \
         starting from the last complete unit of work.\n\
         Do not repeat text that was already produced. If the cut happened inside a code \
         block, continue the code without reopening the fence.\n\n\
         ## Original request\n{prompt}\n\n\
         ## Progress\n{produced} characters produced over {attempt} attempt(s).\n\n\
         ## End of the incomplete reply\n{tail}",
        reason = checkpoint.reason,
        prompt = checkpoint.prompt,
        produced = checkpoint.produced_chars,
        attempt = checkpoint.attempt,
        tail = checkpoint.partial_tail,
    );
    let mut request = CompletionRequest::new(Purpose::Resume, prompt)
        .with_context(checkpoint.context.clone())
        .for_task(checkpoint.task_id.clone(), checkpoint.step_id);
    request.resume_after = Some(checkpoint.seq);
    request
}
