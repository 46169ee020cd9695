use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub healing: HealingConfig,

    #[serde(default)]
    pub continuation: ContinuationConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub task: TaskConfig,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub events_out: EventsOutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// If true, log to stderr.
    #[serde(default = "default_logging_console")]
    pub console: bool,

    /// If true, log to a file under `directory` (or OS temp dir if unset).
    #[serde(default = "default_logging_file")]
    pub file: bool,

    /// EnvFilter string, e.g. "info" or "autopilot_core=debug".
    #[serde(default = "default_logging_level")]
    pub level: String,

    /// Optional directory for log files. If empty or unset, uses OS temp dir.
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_logging_console() -> bool {
    true
}

fn default_logging_file() -> bool {
    false
}

fn default_logging_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            console: default_logging_console(),
            file: default_logging_file(),
            level: default_logging_level(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock limit per execution. Clamped to 1..=3600.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,

    /// Per-stream capture cap in bytes. Excess output is dropped and marked.
    #[serde(default = "default_capture_bytes")]
    pub capture_bytes: usize,

    /// Variables copied from the parent environment into the child.
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,

    /// Root for per-task working directories. Defaults to `<data dir>/workspaces`.
    #[serde(default)]
    pub workspace_root: Option<String>,

    /// Extra or overriding language entries.
    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
}

fn default_sandbox_timeout_secs() -> u64 {
    300
}

fn default_capture_bytes() -> usize {
    10_000
}

fn default_env_allowlist() -> Vec<String> {
    ["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR", "JAVA_HOME"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout_secs(),
            capture_bytes: default_capture_bytes(),
            env_allowlist: default_env_allowlist(),
            workspace_root: None,
            languages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Total attempts allowed per step, shared with the task state machine.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationConfig {
    #[serde(default = "default_continuation_max_attempts")]
    pub max_attempts: u32,

    /// Checkpoints older than this are collected.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// At most this many checkpoints are kept per task.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,

    /// Word-set Jaccard similarity at which two continuation chunks count as a stall.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Characters of partial output carried into the resume prompt.
    #[serde(default = "default_tail_chars")]
    pub tail_chars: usize,
}

fn default_continuation_max_attempts() -> u32 {
    5
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_keep_last() -> usize {
    5
}

fn default_similarity_threshold() -> f64 {
    0.95
}

fn default_tail_chars() -> usize {
    1_000
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_continuation_max_attempts(),
            retention_secs: default_retention_secs(),
            keep_last: default_keep_last(),
            similarity_threshold: default_similarity_threshold(),
            tail_chars: default_tail_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Most recent blocks that are never evicted or condensed.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Eviction threshold in estimated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Fraction of `max_tokens` used as the compression target.
    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: f64,
}

fn default_window_size() -> usize {
    5
}

fn default_max_tokens() -> usize {
    4_000
}

fn default_compression_ratio() -> f64 {
    0.3
}

impl MemoryConfig {
    pub fn target_budget(&self) -> usize {
        let ratio = self.compression_ratio.clamp(0.05, 1.0);
        ((self.max_tokens as f64) * ratio).round() as usize
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            max_tokens: default_max_tokens(),
            compression_ratio: default_compression_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the failed step's dependents; independent branches keep running.
    IsolateBranch,
    /// Stop the whole task at the first terminal step failure.
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,

    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Language used when neither the plan nor the code fence names one.
    #[serde(default = "default_language")]
    pub default_language: String,
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::IsolateBranch
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_language() -> String {
    "python".to_string()
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            failure_policy: default_failure_policy(),
            max_parallel_steps: default_max_parallel_steps(),
            default_language: default_language(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionProvider {
    Http,
    Replay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: CompletionProvider,

    #[serde(default)]
    pub http: HttpCompletionConfig,

    #[serde(default)]
    pub replay: ReplayCompletionConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_completion_provider() -> CompletionProvider {
    CompletionProvider::Http
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            http: HttpCompletionConfig::default(),
            replay: ReplayCompletionConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCompletionConfig {
    #[serde(default = "default_completion_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    /// Use server-sent events and fold the chunks.
    #[serde(default)]
    pub stream: bool,
}

fn default_completion_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_completion_max_tokens() -> u32 {
    4_096
}

fn default_completion_timeout_secs() -> u64 {
    60
}

impl Default for HttpCompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_url(),
            api_key: String::new(),
            model: default_completion_model(),
            temperature: default_temperature(),
            max_tokens: default_completion_max_tokens(),
            timeout_secs: default_completion_timeout_secs(),
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayCompletionConfig {
    /// JSONL file of scripted responses, consumed in order.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_safety_enabled")]
    pub enabled: bool,

    /// Modules that may not be imported by generated code.
    #[serde(default = "default_restricted_modules")]
    pub restricted_modules: Vec<String>,

    /// Additional regex patterns that reject code on match.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

fn default_safety_enabled() -> bool {
    true
}

fn default_restricted_modules() -> Vec<String> {
    ["os", "sys", "subprocess", "socket"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: default_safety_enabled(),
            restricted_modules: default_restricted_modules(),
            deny_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreProvider {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_provider")]
    pub provider: StoreProvider,

    /// Root directory for the file store. Defaults to `<data dir>/store`.
    #[serde(default)]
    pub path: Option<String>,
}

fn default_store_provider() -> StoreProvider {
    StoreProvider::File
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            provider: default_store_provider(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsOutConfig {
    pub enabled: bool,
    pub path: String,
    pub channel_capacity: usize,
    pub drop_when_full: bool,
}

impl Default for EventsOutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "./progress.events.jsonl".to_string(),
            channel_capacity: 2048,
            drop_when_full: true,
        }
    }
}
