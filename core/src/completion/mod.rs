//! Boundary to the language model.

mod extract;
mod retry;
mod traits;
mod types;

pub use extract::{extract_code_blocks, first_code_block, CodeBlock};
pub use retry::{complete_with_retry, Backoff};
pub use traits::{collect_stream, CompletionService, CompletionStream};
pub use types::{CompletionChunk, CompletionRequest, CompletionResponse, FinishReason, Purpose};
