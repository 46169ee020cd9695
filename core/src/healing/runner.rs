use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::completion::{
    complete_with_retry, first_code_block, Backoff, CompletionRequest, CompletionService, Purpose,
};
use crate::error::{EngineError, ErrorKind};
use crate::events::{EventJournal, EventKind};
use crate::history::{ExecutionHistory, ExecutionRecord, RecordLabels};
use crate::safety::SafetyValidator;
use crate::sandbox::{OutputLine, SandboxRequest, SandboxRunner};
use crate::task::StepStatus;

use super::ledger::AttemptLedger;
use super::repair::{fence_names, repair_prompt};

#[derive(Debug, Clone)]
pub struct HealingRequest {
    pub language: String,
    pub code: String,
    /// What the code is meant to do; included in repair prompts.
    pub goal: Option<String>,
    pub workdir: Option<PathBuf>,
    pub follow: Option<mpsc::Sender<OutputLine>>,
}

impl HealingRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            goal: None,
            workdir: None,
            follow: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn in_dir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

#[derive(Clone)]
pub struct SelfHealingLoop {
    sandbox: Arc<dyn SandboxRunner>,
    validator: Arc<dyn SafetyValidator>,
    completion: Arc<dyn CompletionService>,
    history: ExecutionHistory,
    backoff: Backoff,
    timeout: Duration,
    journal: Option<EventJournal>,
}

impl SelfHealingLoop {
    pub fn new(
        sandbox: Arc<dyn SandboxRunner>,
        validator: Arc<dyn SafetyValidator>,
        completion: Arc<dyn CompletionService>,
        history: ExecutionHistory,
        backoff: Backoff,
        timeout: Duration,
    ) -> Self {
        Self {
            sandbox,
            validator,
            completion,
            history,
            backoff,
            timeout,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: EventJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Run `request.code` until it succeeds or the ledger runs out of attempts.
    ///
    /// Every attempt is screened first; a rejection is returned before anything runs.
    /// Every attempt that runs is appended to the history before its outcome is
    /// reported to the ledger.
    pub async fn execute_with_healing(
        &self,
        ledger: &dyn AttemptLedger,
        request: HealingRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionRecord, EngineError> {
        let language = request.language.clone();
        let mut code = request.code.clone();

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !self.sandbox.supports(&language) {
                return Err(EngineError::UnsupportedLanguage(language));
            }
            let validation = self.validator.validate(&code, &language).await;
            if !validation.allowed {
                tracing::warn!(
                    validator = self.validator.name(),
                    task_id = ledger.task_id().unwrap_or("-"),
                    violations = validation.violations.len(),
                    "code rejected by safety validator"
                );
                return Err(EngineError::SafetyRejected {
                    violations: validation.violations,
                });
            }

            let attempt = ledger.begin_attempt().await?;
            self.publish(ledger, |step| EventKind::StepStarted { step, attempt })
                .await;

            let mut sandbox_request =
                SandboxRequest::new(&language, code.clone(), self.timeout).labelled(RecordLabels {
                    task_id: ledger.task_id().map(str::to_string),
                    step_id: ledger.step_id(),
                    attempt,
                });
            sandbox_request.workdir = request.workdir.clone();
            sandbox_request.follow = request.follow.clone();

            let record = self.sandbox.run(sandbox_request, cancel.clone()).await?;
            self.history.append(&record).await?;

            if record.error_kind() == Some(ErrorKind::Cancelled) || cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match ledger.record_outcome(&record).await? {
                StepStatus::Completed => {
                    tracing::info!(
                        task_id = ledger.task_id().unwrap_or("-"),
                        step = ?ledger.step_id(),
                        attempt,
                        duration_ms = record.duration_ms,
                        "execution succeeded"
                    );
                    return Ok(record);
                }
                StepStatus::Pending => {
                    let error_kind = record.error_kind();
                    tracing::warn!(
                        task_id = ledger.task_id().unwrap_or("-"),
                        step = ?ledger.step_id(),
                        attempt,
                        error.kind = ?error_kind,
                        error.message = %record.failure_summary(),
                        "execution failed, repairing"
                    );
                    self.publish(ledger, |step| EventKind::StepRetrying {
                        step,
                        attempt,
                        error_kind,
                    })
                    .await;
                    code = self
                        .repair(ledger, request.goal.as_deref(), &code, &record, cancel)
                        .await?;
                    ledger.store_code(&code).await?;
                }
                _ => {
                    let step = match ledger.step_id() {
                        Some(id) => id.to_string(),
                        None => "adhoc".to_string(),
                    };
                    return Err(EngineError::HealingExhausted {
                        step,
                        attempts: attempt,
                        last_record: Box::new(record),
                    });
                }
            }
        }
    }

    /// Ask for a fix. Falls back to the same code when the reply carries no code block.
    async fn repair(
        &self,
        ledger: &dyn AttemptLedger,
        goal: Option<&str>,
        code: &str,
        record: &ExecutionRecord,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let mut request = CompletionRequest::new(Purpose::Repair, repair_prompt(goal, code, record));
        if let Some(task_id) = ledger.task_id() {
            request = request.for_task(task_id, ledger.step_id());
        }
        let response =
            complete_with_retry(self.completion.as_ref(), &request, &self.backoff, cancel).await?;

        let names = fence_names(&record.language);
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        match first_code_block(&response.text, Some(&names)) {
            Some(block) => Ok(block.code),
            None => {
                tracing::debug!(
                    task_id = ledger.task_id().unwrap_or("-"),
                    "repair reply had no code block, re-running unchanged code"
                );
                Ok(code.to_string())
            }
        }
    }

    async fn publish(
        &self,
        ledger: &dyn AttemptLedger,
        kind: impl FnOnce(crate::task::StepId) -> EventKind,
    ) {
        if let (Some(journal), Some(task_id), Some(step)) =
            (&self.journal, ledger.task_id(), ledger.step_id())
        {
            journal.publish(task_id, kind(step)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::StandaloneLedger;
    use crate::history::ErrorClass;
    use crate::safety::{AllowAll, Validation, Violation};
    use crate::store::MemoryStore;
    use crate::completion::CompletionResponse;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    /// Fails until it sees code containing `fixed`.
    struct NeedsFix {
        runs: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl SandboxRunner for NeedsFix {
        fn name(&self) -> &str {
            "needs_fix"
        }
        fn supports(&self, language: &str) -> bool {
            language == "python"
        }
        async fn run(
            &self,
            request: SandboxRequest,
            _cancel: CancellationToken,
        ) -> Result<ExecutionRecord, EngineError> {
            self.runs.lock().unwrap().push(request.code.clone());
            let ok = request.code.contains("fixed");
            Ok(ExecutionRecord {
                id: Uuid::new_v4(),
                task_id: request.labels.task_id,
                step_id: request.labels.step_id,
                attempt: request.labels.attempt,
                language: request.language,
                code: request.code,
                stdout: if ok { "done\n".into() } else { String::new() },
                stderr: if ok { String::new() } else { "ValueError: boom".into() },
                stdout_truncated: false,
                stderr_truncated: false,
                exit_code: Some(if ok { 0 } else { 1 }),
                duration_ms: 1,
                success: ok,
                error: (!ok).then(|| ErrorClass {
                    kind: ErrorKind::Runtime,
                    message: "boom".into(),
                    exception: Some("ValueError".into()),
                }),
                created_at: Utc::now(),
            })
        }
    }

    struct Fixer(String);

    #[async_trait]
    impl CompletionService for Fixer {
        fn name(&self) -> &str {
            "fixer"
        }
        async fn complete(&self, r: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
            assert_eq!(r.purpose, Purpose::Repair);
            assert!(r.prompt.contains("ValueError"));
            Ok(CompletionResponse::stop(self.0.clone()))
        }
    }

    struct DenyAll;

    #[async_trait]
    impl SafetyValidator for DenyAll {
        fn name(&self) -> &str {
            "deny"
        }
        async fn validate(&self, _code: &str, _language: &str) -> Validation {
            Validation::from_violations(vec![Violation::new("test", "nope")])
        }
    }

    fn healing(
        sandbox: Arc<NeedsFix>,
        validator: Arc<dyn SafetyValidator>,
        reply: &str,
    ) -> (SelfHealingLoop, ExecutionHistory) {
        let history = ExecutionHistory::new(Arc::new(MemoryStore::new()));
        let lp = SelfHealingLoop::new(
            sandbox,
            validator,
            Arc::new(Fixer(reply.to_string())),
            history.clone(),
            Backoff::new(Default::default()),
            Duration::from_secs(5),
        );
        (lp, history)
    }

    fn sandbox() -> Arc<NeedsFix> {
        Arc::new(NeedsFix {
            runs: StdMutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn repaired_code_is_rerun() {
        let sb = sandbox();
        let (lp, history) = healing(sb.clone(), Arc::new(AllowAll), "```python\nprint('fixed')\n```");
        let ledger = StandaloneLedger::new(3);

        let rec = lp
            .execute_with_healing(
                &ledger,
                HealingRequest::new("python", "raise ValueError('boom')"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(rec.success);
        assert_eq!(rec.attempt, 2);
        assert_eq!(
            *sb.runs.lock().unwrap(),
            vec!["raise ValueError('boom')", "print('fixed')"]
        );
        assert_eq!(history.adhoc(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exhaustion_carries_last_record() {
        let sb = sandbox();
        let (lp, history) = healing(sb.clone(), Arc::new(AllowAll), "no code here");
        let ledger = StandaloneLedger::new(2);

        let err = lp
            .execute_with_healing(
                &ledger,
                HealingRequest::new("python", "raise ValueError('boom')"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            EngineError::HealingExhausted {
                attempts,
                last_record,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_record.attempt, 2);
                assert!(!last_record.success);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Without a code block the same code runs again.
        assert_eq!(sb.runs.lock().unwrap().len(), 2);
        assert_eq!(history.adhoc(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejected_code_never_runs() {
        let sb = sandbox();
        let (lp, history) = healing(sb.clone(), Arc::new(DenyAll), "");
        let ledger = StandaloneLedger::new(3);

        let err = lp
            .execute_with_healing(
                &ledger,
                HealingRequest::new("python", "import os"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::SafetyRejected { .. }));
        assert!(sb.runs.lock().unwrap().is_empty());
        assert_eq!(ledger.attempts(), 0);
        assert!(history.adhoc(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_language_is_structural() {
        let sb = sandbox();
        let (lp, _) = healing(sb.clone(), Arc::new(AllowAll), "");
        let err = lp
            .execute_with_healing(
                &StandaloneLedger::new(3),
                HealingRequest::new("cobol", "DISPLAY 'HI'."),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedLanguage(_)));
    }
}
