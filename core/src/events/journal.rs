use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use super::types::{EventKind, ProgressEvent};
use super::writer::EventSink;

const DEFAULT_RETAIN: usize = 4096;

/// Per-session ordered event log.
///
/// Events stay buffered until the client acknowledges them, so a client that reconnects
/// with its last acknowledged sequence number receives everything after it, then live
/// events, with no gap and no duplicate.
#[derive(Clone)]
pub struct EventJournal {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<HashMap<String, SessionLog>>,
    event_tx: broadcast::Sender<ProgressEvent>,
    /// Upper bound on unacknowledged events kept per session.
    retain: usize,
    sink: Option<EventSink>,
}

#[derive(Default)]
struct SessionLog {
    next_seq: u64,
    acked: u64,
    events: VecDeque<ProgressEvent>,
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::new(DEFAULT_RETAIN, None)
    }
}

impl EventJournal {
    pub fn new(retain: usize, sink: Option<EventSink>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                event_tx,
                retain: retain.max(1),
                sink,
            }),
        }
    }

    /// Append an event and fan it out. Returns its sequence number (1-based per session).
    pub async fn publish(&self, session: &str, kind: EventKind) -> u64 {
        let event = {
            let mut sessions = self.inner.sessions.write().await;
            let log = sessions.entry(session.to_string()).or_default();
            log.next_seq += 1;
            let event = ProgressEvent {
                session: session.to_string(),
                seq: log.next_seq,
                at: Utc::now(),
                kind,
            };
            log.events.push_back(event.clone());
            while log.events.len() > self.inner.retain {
                log.events.pop_front();
            }
            // Sent under the lock so subscribers never see a gap between backlog and live.
            let _ = self.inner.event_tx.send(event.clone());
            event
        };

        tracing::debug!(
            target: "autopilot.flow",
            session = %event.session,
            seq = event.seq,
            kind = ?event.kind,
            "progress event"
        );
        if let Some(sink) = &self.inner.sink {
            sink.send(&event).await;
        }
        event.seq
    }

    /// Subscribe to `session`, replaying every retained event after `last_ack`.
    pub async fn subscribe(&self, session: &str, last_ack: Option<u64>) -> Subscription {
        let sessions = self.inner.sessions.read().await;
        let rx = self.inner.event_tx.subscribe();
        let after = last_ack.unwrap_or(0);
        let backlog: VecDeque<ProgressEvent> = sessions
            .get(session)
            .map(|log| log.events.iter().filter(|e| e.seq > after).cloned().collect())
            .unwrap_or_default();
        Subscription {
            session: session.to_string(),
            last_seen: after,
            backlog,
            rx,
        }
    }

    /// Mark events up to `seq` as delivered; they are no longer replayed.
    pub async fn ack(&self, session: &str, seq: u64) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(log) = sessions.get_mut(session) {
            log.acked = log.acked.max(seq.min(log.next_seq));
            let acked = log.acked;
            while log.events.front().map(|e| e.seq <= acked).unwrap_or(false) {
                log.events.pop_front();
            }
        }
    }

    pub async fn last_seq(&self, session: &str) -> u64 {
        self.inner
            .sessions
            .read()
            .await
            .get(session)
            .map(|l| l.next_seq)
            .unwrap_or(0)
    }

    /// Every retained event of a session, oldest first.
    pub async fn events(&self, session: &str) -> Vec<ProgressEvent> {
        self.inner
            .sessions
            .read()
            .await
            .get(session)
            .map(|l| l.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a finished session's log.
    pub async fn close(&self, session: &str) {
        self.inner.sessions.write().await.remove(session);
    }
}

/// Backlog first, then live events for one session, deduplicated by sequence number.
pub struct Subscription {
    session: String,
    last_seen: u64,
    backlog: VecDeque<ProgressEvent>,
    rx: broadcast::Receiver<ProgressEvent>,
}

impl Subscription {
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Next event, or `None` once the journal is gone.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_seen = event.seq;
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.session == self.session && event.seq > self.last_seen => {
                    self.last_seen = event.seq;
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %self.session, skipped, "progress subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
