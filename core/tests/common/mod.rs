#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autopilot_core::api::{
    AllowAll, AppConfig, CompletionRequest, CompletionResponse, CompletionService, EngineError,
    ErrorClass, ErrorKind, EventJournal, ExecutionRecord, MemoryStore, Orchestrator,
    ProcessSandbox, Purpose, SandboxRequest, SandboxRunner, Services, Store,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ordered log of completion calls and sandbox runs, shared by the fakes below.
#[derive(Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<String>>>);

impl Timeline {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Completion service that replays canned replies per purpose.
///
/// Resume requests are checked against the store: the checkpoint they name must already
/// be persisted.
pub struct ScriptedCompletion {
    replies: Mutex<HashMap<Purpose, VecDeque<CompletionResponse>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
    store: Arc<dyn Store>,
    timeline: Timeline,
}

impl ScriptedCompletion {
    pub fn new(store: Arc<dyn Store>, timeline: Timeline) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            store,
            timeline,
        }
    }

    pub fn on(self, purpose: Purpose, reply: CompletionResponse) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn requests_for(&self, purpose: Purpose) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.purpose == purpose)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        if let (Some(seq), Some(task)) = (request.resume_after, request.task_id.as_deref()) {
            let key = format!("checkpoints/{task}/{seq:010}");
            anyhow::ensure!(
                self.store.get(&key).await?.is_some(),
                "resume_after={seq} requested before checkpoint {key} was persisted"
            );
        }
        self.timeline.push(format!(
            "completion:{:?}:{}",
            request.purpose,
            request
                .resume_after
                .map(|s| s.to_string())
                .unwrap_or_default()
        ));
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| anyhow::anyhow!("no scripted reply for {:?}", request.purpose))
    }
}

/// Sandbox double: code containing `raise` fails with a Python `ValueError`, anything
/// else succeeds and echoes its code.
pub struct FakeSandbox {
    timeline: Timeline,
}

impl FakeSandbox {
    pub fn new(timeline: Timeline) -> Self {
        Self { timeline }
    }
}

#[async_trait]
impl SandboxRunner for FakeSandbox {
    fn name(&self) -> &str {
        "fake"
    }

    fn supports(&self, language: &str) -> bool {
        matches!(language, "python" | "shell" | "bash")
    }

    async fn run(
        &self,
        request: SandboxRequest,
        _cancel: CancellationToken,
    ) -> Result<ExecutionRecord, EngineError> {
        self.timeline.push(format!("run:{}", request.labels.attempt));
        let fails = request.code.contains("raise");
        Ok(ExecutionRecord {
            id: Uuid::new_v4(),
            task_id: request.labels.task_id,
            step_id: request.labels.step_id,
            attempt: request.labels.attempt,
            language: request.language,
            stdout: if fails {
                String::new()
            } else {
                format!("{}\n", request.code)
            },
            stderr: if fails {
                "Traceback (most recent call last):\n  File \"main.py\", line 1, in <module>\nValueError: bad value".into()
            } else {
                String::new()
            },
            code: request.code,
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: Some(if fails { 1 } else { 0 }),
            duration_ms: 1,
            success: !fails,
            error: fails.then(|| ErrorClass {
                kind: ErrorKind::Runtime,
                message: "bad value".into(),
                exception: Some("ValueError".into()),
            }),
            created_at: Utc::now(),
        })
    }
}

/// Real process sandbox that also logs each run on the timeline.
pub struct CountingSandbox {
    inner: ProcessSandbox,
    timeline: Timeline,
}

impl CountingSandbox {
    pub fn new(inner: ProcessSandbox, timeline: Timeline) -> Self {
        Self { inner, timeline }
    }
}

#[async_trait]
impl SandboxRunner for CountingSandbox {
    fn name(&self) -> &str {
        "counting"
    }

    fn supports(&self, language: &str) -> bool {
        self.inner.supports(language)
    }

    async fn run(
        &self,
        request: SandboxRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord, EngineError> {
        self.timeline.push(format!("run:{}", request.labels.attempt));
        self.inner.run(request, cancel).await
    }
}

pub fn test_config(workspaces: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.sandbox.workspace_root = Some(workspaces.to_string_lossy().to_string());
    cfg.sandbox.timeout_secs = 10;
    cfg.healing.max_retries = 2;
    cfg.completion.retry.max_attempts = 1;
    cfg.completion.retry.base_delay_ms = 1;
    cfg.completion.retry.max_delay_ms = 1;
    cfg
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
    pub completion: Arc<ScriptedCompletion>,
    pub timeline: Timeline,
}

pub fn harness<F>(
    cfg: AppConfig,
    script: F,
    sandbox: impl FnOnce(Timeline) -> Arc<dyn SandboxRunner>,
) -> Harness
where
    F: FnOnce(ScriptedCompletion) -> ScriptedCompletion,
{
    init_test_logging();
    let timeline = Timeline::default();
    let store = Arc::new(MemoryStore::new());
    let completion = Arc::new(script(ScriptedCompletion::new(
        store.clone(),
        timeline.clone(),
    )));
    let services = Services {
        completion: completion.clone(),
        validator: Arc::new(AllowAll),
        store: store.clone(),
        sandbox: sandbox(timeline.clone()),
    };
    Harness {
        orchestrator: Orchestrator::new(cfg, services, EventJournal::default()),
        store,
        completion,
        timeline,
    }
}

/// A fresh engine over the harness's store and completion script, as after a restart.
pub fn restarted(h: &Harness, cfg: AppConfig) -> Orchestrator {
    let services = Services {
        completion: h.completion.clone(),
        validator: Arc::new(AllowAll),
        store: h.store.clone(),
        sandbox: fake_sandbox(h.timeline.clone()),
    };
    Orchestrator::new(cfg, services, EventJournal::default())
}

/// Route engine logs through the test writer; `RUST_LOG=debug` shows them with `--nocapture`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fake_sandbox(timeline: Timeline) -> Arc<dyn SandboxRunner> {
    Arc::new(FakeSandbox::new(timeline))
}

pub fn real_sandbox(cfg: &AppConfig) -> impl FnOnce(Timeline) -> Arc<dyn SandboxRunner> {
    let sandbox = cfg.sandbox.clone();
    move |timeline| {
        Arc::new(CountingSandbox::new(
            ProcessSandbox::from_config(&sandbox),
            timeline,
        ))
    }
}

/// True once `pid` is gone or only a zombie awaiting its reaper.
#[cfg(target_os = "linux")]
pub fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

pub async fn wait_until<F: Fn() -> bool>(check: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
