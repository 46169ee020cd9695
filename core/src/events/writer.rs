use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::config::EventsOutConfig;
use crate::util::preview;

use super::types::ProgressEvent;

/// Sender side of the JSONL event file. With `drop_when_full` a slow disk never stalls
/// the engine; dropped lines are counted instead.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
    drop_when_full: bool,
}

impl EventSink {
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn send(&self, event: &ProgressEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            tracing::warn!(seq = event.seq, "progress event not serializable");
            return;
        };
        let delivered = if self.drop_when_full {
            self.tx.try_send(line).is_ok()
        } else {
            self.tx.send(line).await.is_ok()
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

const STDOUT_TARGET: &str = "stdout:";

async fn open_target(path: &str) -> Result<Box<dyn AsyncWrite + Unpin + Send>, String> {
    if path == STDOUT_TARGET {
        return Ok(Box::new(tokio::io::stdout()));
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| format!("progress sink {path}: {e}"))?;
    Ok(Box::new(file))
}

async fn drain(
    mut rx: mpsc::Receiver<String>,
    mut out: Box<dyn AsyncWrite + Unpin + Send>,
    audit_stdout: bool,
) {
    while let Some(line) = rx.recv().await {
        if audit_stdout {
            tracing::debug!(
                target: "autopilot.stdout_audit",
                bytes = line.len(),
                preview = %preview(&line, 120),
                "progress line"
            );
        }
        let written = async {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(error = %e, "progress sink closed");
            return;
        }
    }
}

/// Spawn the JSONL writer for `cfg`. `None` when the sink is disabled or has no path;
/// the path `stdout:` writes to standard output.
pub async fn start_event_sink(cfg: &EventsOutConfig) -> Result<Option<EventSink>, String> {
    let path = cfg.path.trim();
    if !cfg.enabled || path.is_empty() {
        return Ok(None);
    }
    let out = open_target(path).await?;
    let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
    tokio::spawn(drain(rx, out, path == STDOUT_TARGET));

    Ok(Some(EventSink {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
        drop_when_full: cfg.drop_when_full,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use chrono::Utc;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let cfg = EventsOutConfig {
            enabled: true,
            path: path.to_string_lossy().to_string(),
            channel_capacity: 8,
            drop_when_full: false,
        };
        let sink = start_event_sink(&cfg).await.unwrap().unwrap();
        for seq in 1..=2 {
            sink.send(&ProgressEvent {
                session: "t".into(),
                seq,
                at: Utc::now(),
                kind: EventKind::TaskStarted,
            })
            .await;
        }
        drop(sink);

        let mut text = String::new();
        for _ in 0..50 {
            text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if text.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"task_started\""));
        assert!(lines[1].contains("\"seq\":2"));
    }

    #[tokio::test]
    async fn disabled_sink_is_none() {
        let cfg = EventsOutConfig::default();
        assert!(start_event_sink(&cfg).await.unwrap().is_none());
    }
}
