//! Truncation detection, checkpointing and resumption of model output.

mod checkpoint;
mod detect;
mod manager;
mod stall;

pub use checkpoint::{Checkpoint, CheckpointStore, NewCheckpoint};
pub use detect::{detect_truncation, TruncationReason};
pub use manager::{
    resume_request, ContinuationHost, ContinuationManager, DetachedHost, Generation, Phase,
};
pub use stall::{jaccard_similarity, StallDetector};
