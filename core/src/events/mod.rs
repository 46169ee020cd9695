//! Ordered per-session progress events with resume-from-ack.

mod journal;
mod types;
mod writer;

pub use journal::{EventJournal, Subscription};
pub use types::{EventKind, ProgressEvent};
pub use writer::{start_event_sink, EventSink};
