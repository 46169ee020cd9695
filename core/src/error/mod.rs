#[allow(clippy::module_inception)]
pub mod error;
pub mod plan;

pub use error::{CliError, EngineError, ErrorKind, StoreError};
pub use plan::PlanError;

pub type EngineResult<T> = Result<T, EngineError>;
