mod memory;
mod traits;

pub use memory::MemoryStore;
pub use traits::{get_json, put_json, Store};
