//! Bounded working context for a task.

mod block;
mod manager;
mod tokens;

pub use block::{BlockId, BlockStatus, MemoryBlock};
pub use manager::{MemoryManager, MemoryStats};
pub use tokens::TokenEstimator;
