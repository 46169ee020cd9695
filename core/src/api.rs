//! Stable re-exports for consumers (`cli`, `plugins`, and external crates).
//!
//! Prefer importing from `autopilot_core::api` instead of reaching into internal modules.

pub use crate::completion::{
    collect_stream, complete_with_retry, first_code_block, Backoff, CompletionChunk,
    CompletionRequest, CompletionResponse, CompletionService, CompletionStream, FinishReason,
    Purpose,
};
pub use crate::config::{
    apply_env_overrides, get_autopilot_data_dir, load_default, load_from_path, AppConfig,
    CompletionConfig, CompletionProvider, FailurePolicy, HttpCompletionConfig, LoggingConfig,
    ReplayCompletionConfig, RetryConfig, SafetyConfig, StoreConfig, StoreProvider,
};
pub use crate::context::{AppContext, Services, ServicesFactory};
pub use crate::continuation::{
    detect_truncation, resume_request, Checkpoint, CheckpointStore, ContinuationManager,
    NewCheckpoint, TruncationReason,
};
pub use crate::error::{CliError, EngineError, ErrorKind, PlanError, StoreError};
pub use crate::events::{EventJournal, EventKind, ProgressEvent, Subscription};
pub use crate::healing::{AttemptLedger, HealingRequest, SelfHealingLoop, StandaloneLedger};
pub use crate::history::{ErrorClass, ExecutionHistory, ExecutionRecord, RecordLabels};
pub use crate::memory::{MemoryManager, TokenEstimator};
pub use crate::orchestrator::{FailureDiagnostic, Orchestrator, TaskOutcome};
pub use crate::safety::{AllowAll, SafetyValidator, Validation, Violation};
pub use crate::sandbox::{
    LanguageRegistry, OutputLine, OutputStream, ProcessSandbox, SandboxRequest, SandboxRunner,
    TIMEOUT_EXIT_CODE,
};
pub use crate::store::{get_json, put_json, MemoryStore, Store};
pub use crate::task::{
    parse_plan, PlannedStep, SkipReason, Step, StepId, StepStatus, Task, TaskStateMachine,
    TaskStatus,
};
