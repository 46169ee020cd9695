use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{EngineError, ErrorKind};
use crate::history::{ErrorClass, ExecutionRecord};
use crate::util::preview;

use super::capture::{CaptureMode, CappedCapture};
use super::classify::classify_failure;
use super::io_pump::{pump, OutputStream};
use super::language::{LanguageRegistry, LanguageSpec};
use super::traits::{SandboxRequest, SandboxRunner};

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const MAX_TIMEOUT_SECS: u64 = 60 * 60;

/// Exit code reported for timed-out runs, as coreutils `timeout` does.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long pipes may stay open after the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub fn effective_timeout(timeout_secs: Option<u64>) -> Duration {
    let v = timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
    Duration::from_secs(v.clamp(1, MAX_TIMEOUT_SECS))
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs each snippet as a child process in its own process group, with a cleared
/// environment and capped output capture.
pub struct ProcessSandbox {
    registry: LanguageRegistry,
    capture_bytes: usize,
    env_allowlist: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(registry: LanguageRegistry, capture_bytes: usize, env_allowlist: Vec<String>) -> Self {
        Self {
            registry,
            capture_bytes: capture_bytes.max(1),
            env_allowlist,
        }
    }

    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self::new(
            LanguageRegistry::with_overrides(&cfg.languages),
            cfg.capture_bytes,
            cfg.env_allowlist.clone(),
        )
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    fn command(&self, spec: &LanguageSpec, source: &Path, workdir: &Path) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .arg(source)
            .current_dir(workdir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.env_allowlist {
            if let Ok(v) = std::env::var(key) {
                cmd.env(key, v);
            }
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    fn supports(&self, language: &str) -> bool {
        self.registry.supports(language)
    }

    async fn run(
        &self,
        request: SandboxRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord, EngineError> {
        let spec = self.registry.resolve(&request.language)?.clone();
        let started = Instant::now();
        let mut draft = Draft::new(&request, &spec);

        let scratch = match tempfile::Builder::new().prefix("autopilot-run-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return Ok(draft.spawn_failed(started, format!("scratch dir: {e}"))),
        };
        let source = scratch.path().join(&spec.file_name);
        if let Err(e) = tokio::fs::write(&source, request.code.as_bytes()).await {
            return Ok(draft.spawn_failed(started, format!("write source: {e}")));
        }
        let workdir = match &request.workdir {
            Some(dir) => {
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    return Ok(draft.spawn_failed(started, format!("workdir: {e}")));
                }
                dir.clone()
            }
            None => scratch.path().to_path_buf(),
        };

        let mut child = match self.command(&spec, &source, &workdir).spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(draft.spawn_failed(
                    started,
                    format!("failed to start {}: {e}", spec.program),
                ))
            }
        };

        // Captured now: `Child::id` is gone once the child has been waited on.
        let pgid = child.id();
        tracing::debug!(
            target: "autopilot.flow",
            language = %spec.name,
            pid = pgid,
            timeout_ms = request.timeout.as_millis() as u64,
            code = %preview(&request.code, 160),
            "sandbox spawned"
        );

        let out_cap = CappedCapture::new(self.capture_bytes, CaptureMode::Head);
        let err_cap = CappedCapture::new(self.capture_bytes, CaptureMode::Tail);
        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(pump(out, out_cap.clone(), request.follow.clone(), OutputStream::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(pump(err, err_cap.clone(), request.follow.clone(), OutputStream::Stderr));
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        // Background children outlive a normal exit unless the group goes too.
        kill_tree(&mut child, pgid).await;

        for handle in pumps {
            let abort = handle.abort_handle();
            if tokio::time::timeout(DRAIN_GRACE, handle).await.is_err() {
                // A descendant escaped the group and still holds the pipe.
                abort.abort();
            }
        }

        let stdout = out_cap.finish();
        let stderr = err_cap.finish();
        draft.stdout = stdout.text;
        draft.stdout_truncated = stdout.truncated;
        draft.stderr = stderr.text;
        draft.stderr_truncated = stderr.truncated;

        let record = match outcome {
            Outcome::Exited(Ok(status)) => {
                let exit_code = status.code();
                let error = (!status.success()).then(|| classify_failure(exit_code, &draft.stderr));
                draft.finish(started, exit_code, status.success(), error)
            }
            Outcome::Exited(Err(e)) => draft.finish(
                started,
                None,
                false,
                Some(ErrorClass {
                    kind: ErrorKind::SpawnFailed,
                    message: format!("wait failed: {e}"),
                    exception: None,
                }),
            ),
            Outcome::TimedOut => draft.finish(
                started,
                Some(TIMEOUT_EXIT_CODE),
                false,
                Some(ErrorClass {
                    kind: ErrorKind::Timeout,
                    message: format!(
                        "execution exceeded {} ms and was killed",
                        request.timeout.as_millis()
                    ),
                    exception: None,
                }),
            ),
            Outcome::Cancelled => draft.finish(
                started,
                None,
                false,
                Some(ErrorClass {
                    kind: ErrorKind::Cancelled,
                    message: "execution cancelled".into(),
                    exception: None,
                }),
            ),
        };

        if record.success {
            tracing::info!(
                language = %record.language,
                duration_ms = record.duration_ms,
                "sandbox run succeeded"
            );
        } else {
            tracing::warn!(
                language = %record.language,
                duration_ms = record.duration_ms,
                exit_code = ?record.exit_code,
                error.kind = ?record.error_kind(),
                error.message = %preview(&record.failure_summary(), 160),
                "sandbox run failed"
            );
        }
        Ok(record)
    }
}

/// Kill the child's whole process group, then reap the child. Safe to call after the
/// child itself has exited: its group lives on while any member does.
async fn kill_tree(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pgid {
        // The group id equals the child's pid because of `process_group(0)`.
        // SAFETY: kill(2) with a negative pid signals the process group; no memory is touched.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        let err = std::io::Error::last_os_error();
        if rc != 0 && err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pid, error = %err, "process group kill failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Record fields collected while the run is in flight.
struct Draft {
    language: String,
    code: String,
    labels: crate::history::RecordLabels,
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
}

impl Draft {
    fn new(request: &SandboxRequest, spec: &LanguageSpec) -> Self {
        Self {
            language: spec.name.clone(),
            code: request.code.clone(),
            labels: request.labels.clone(),
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    fn spawn_failed(&mut self, started: Instant, message: String) -> ExecutionRecord {
        tracing::error!(
            language = %self.language,
            error.kind = "spawn_failed",
            error.message = %message,
            "sandbox could not start"
        );
        self.stderr = message.clone();
        self.finish(
            started,
            None,
            false,
            Some(ErrorClass {
                kind: ErrorKind::SpawnFailed,
                message,
                exception: None,
            }),
        )
    }

    fn finish(
        &mut self,
        started: Instant,
        exit_code: Option<i32>,
        success: bool,
        error: Option<ErrorClass>,
    ) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::new_v4(),
            task_id: self.labels.task_id.clone(),
            step_id: self.labels.step_id,
            attempt: self.labels.attempt,
            language: self.language.clone(),
            code: std::mem::take(&mut self.code),
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
            stdout_truncated: self.stdout_truncated,
            stderr_truncated: self.stderr_truncated,
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            success,
            error,
            created_at: Utc::now(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sandbox(cap: usize) -> ProcessSandbox {
        ProcessSandbox::new(
            LanguageRegistry::default(),
            cap,
            vec!["PATH".to_string()],
        )
    }

    fn shell(code: &str, timeout_ms: u64) -> SandboxRequest {
        SandboxRequest::new("bash", code, Duration::from_millis(timeout_ms))
    }

    #[test]
    fn timeout_default_and_clamp() {
        assert_eq!(effective_timeout(None), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(effective_timeout(Some(0)), Duration::from_secs(1));
        assert_eq!(
            effective_timeout(Some(MAX_TIMEOUT_SECS + 10)),
            Duration::from_secs(MAX_TIMEOUT_SECS)
        );
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let rec = sandbox(1024)
            .run(shell("echo hello; echo oops >&2; exit 0", 5_000), CancellationToken::new())
            .await
            .unwrap();
        assert!(rec.success);
        assert_eq!(rec.exit_code, Some(0));
        assert_eq!(rec.stdout, "hello\n");
        assert_eq!(rec.stderr, "oops\n");
        assert_eq!(rec.language, "shell");
        assert!(rec.error.is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_is_classified() {
        let rec = sandbox(1024)
            .run(shell("echo 'bad thing' >&2; exit 3", 5_000), CancellationToken::new())
            .await
            .unwrap();
        assert!(!rec.success);
        assert_eq!(rec.exit_code, Some(3));
        assert_eq!(rec.error_kind(), Some(ErrorKind::NonZeroExit));
    }

    #[tokio::test]
    async fn environment_is_cleared_except_allowlist() {
        std::env::set_var("AUTOPILOT_SANDBOX_SECRET", "leak");
        let rec = sandbox(1024)
            .run(
                shell("echo \"secret=${AUTOPILOT_SANDBOX_SECRET:-none}\"", 5_000),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rec.stdout.trim(), "secret=none");
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_but_success_reflects_exit() {
        let rec = sandbox(100)
            .run(
                shell("for i in $(seq 1 500); do echo line-$i; done; exit 0", 10_000),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(rec.success);
        assert!(rec.stdout_truncated);
        assert!(rec.stdout.starts_with("line-1\n"));
        assert!(rec.stdout.contains("...[truncated "));
    }

    #[tokio::test]
    async fn cancellation_kills_the_run() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let rec = sandbox(1024)
            .run(shell("sleep 30", 60_000), token)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(rec.error_kind(), Some(ErrorKind::Cancelled));
        assert!(!rec.success);
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_failed_record() {
        let mut registry = LanguageRegistry::default();
        registry.insert(LanguageSpec {
            name: "ghost".into(),
            aliases: vec![],
            program: "/nonexistent/ghost-interpreter".into(),
            args: vec![],
            file_name: "main.ghost".into(),
            env: vec![],
        });
        let sb = ProcessSandbox::new(registry, 1024, vec![]);
        let rec = sb
            .run(
                SandboxRequest::new("ghost", "boo", Duration::from_secs(5)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rec.error_kind(), Some(ErrorKind::SpawnFailed));
    }

    #[tokio::test]
    async fn unknown_language_is_an_error() {
        let err = sandbox(1024)
            .run(
                SandboxRequest::new("cobol", "DISPLAY 'HI'.", Duration::from_secs(1)),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedLanguage);
    }
}
