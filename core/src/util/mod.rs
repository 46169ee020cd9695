mod text;

pub use text::{head_tail, preview, tail_chars, truncate_chars};
