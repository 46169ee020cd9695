//! Human-readable rendering of progress events, task outcomes and execution records.

use autopilot_core::api::{
    Checkpoint, EventKind, ExecutionRecord, ProgressEvent, StepStatus, Task, TaskOutcome,
};
use autopilot_core::util::head_tail;

const OUTPUT_HEAD: usize = 1_500;
const OUTPUT_TAIL: usize = 500;

pub fn event_line(event: &ProgressEvent) -> String {
    let what = match &event.kind {
        EventKind::TaskPlanned { steps } => format!("planned {steps} step(s)"),
        EventKind::TaskStarted => "task started".to_string(),
        EventKind::StepStarted { step, attempt } => {
            format!("step {step} started (attempt {attempt})")
        }
        EventKind::StepRetrying {
            step,
            attempt,
            error_kind,
        } => match error_kind {
            Some(kind) => format!("step {step} attempt {attempt} failed ({kind}), repairing"),
            None => format!("step {step} attempt {attempt} failed, repairing"),
        },
        EventKind::StepCompleted { step, attempts } => {
            format!("step {step} completed after {attempts} attempt(s)")
        }
        EventKind::StepFailed {
            step,
            error_kind,
            message,
        } => format!("step {step} failed [{error_kind}]: {message}"),
        EventKind::StepSkipped { step, reason } => format!("step {step} skipped ({reason:?})"),
        EventKind::CheckpointWritten { seq, reason } => {
            format!("checkpoint #{seq} written ({reason})")
        }
        EventKind::TaskPaused { reason } => format!("task paused: {reason}"),
        EventKind::TaskResumed { checkpoint } => match checkpoint {
            Some(seq) => format!("task resumed from checkpoint #{seq}"),
            None => "task resumed".to_string(),
        },
        EventKind::TaskFinished { status } => format!("task finished: {status}"),
    };
    format!("[{}] {what}", event.seq)
}

pub fn outcome_text(outcome: &TaskOutcome) -> String {
    let mut out = task_text(&outcome.task);
    for diag in &outcome.diagnostics {
        let step = diag
            .step_key
            .as_deref()
            .map(|k| format!("step {k}"))
            .unwrap_or_else(|| "task".to_string());
        out.push_str(&format!("\n! {step} [{}]: {}", diag.error_kind, diag.message));
        for v in &diag.violations {
            match v.line {
                Some(line) => out.push_str(&format!("\n    line {line}: {} ({})", v.message, v.rule)),
                None => out.push_str(&format!("\n    {} ({})", v.message, v.rule)),
            }
        }
    }
    out
}

pub fn task_text(task: &Task) -> String {
    let mut out = format!("task {} [{}] {}", task.id, task.status, task.description);
    for step in &task.steps {
        let mark = match step.status {
            StepStatus::Completed => "ok",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "skipped",
            StepStatus::Running => "running",
            StepStatus::Ready | StepStatus::Pending => "pending",
        };
        out.push_str(&format!(
            "\n  {:>3} {:<8} {} (attempts {}/{})",
            step.key, mark, step.description, step.retry_count, step.max_retries
        ));
        if let Some(output) = step.artifacts.output.as_deref().filter(|o| !o.trim().is_empty()) {
            for line in head_tail(output.trim_end(), OUTPUT_HEAD, OUTPUT_TAIL, "\n...\n").lines() {
                out.push_str(&format!("\n        | {line}"));
            }
        }
    }
    out
}

pub fn record_line(record: &ExecutionRecord) -> String {
    let step = record
        .step_id
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let exit = record
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    let status = if record.success {
        "ok".to_string()
    } else {
        record.failure_summary()
    };
    format!(
        "{} {} step={} attempt={} lang={} exit={} {}ms {}",
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.task_id.as_deref().unwrap_or("adhoc"),
        step,
        record.attempt,
        record.language,
        exit,
        record.duration_ms,
        status
    )
}

pub fn checkpoint_line(cp: &Checkpoint) -> String {
    let step = cp
        .step_id
        .map(|s| format!(" step={s}"))
        .unwrap_or_default();
    format!(
        "{} #{}{} {:?} reason={} produced={} attempt={}",
        cp.task_id, cp.seq, step, cp.purpose, cp.reason, cp.produced_chars, cp.attempt
    )
}
