mod record;
mod store;

pub use record::{ErrorClass, ExecutionRecord, RecordLabels};
pub use store::ExecutionHistory;
