//! Isolated, time-boxed execution of one code snippet.

mod capture;
mod classify;
mod io_pump;
mod language;
mod process;
mod traits;

pub use capture::{CaptureMode, CappedCapture, CapturedOutput};
pub use classify::classify_failure;
pub use io_pump::{pump, OutputLine, OutputStream};
pub use language::{LanguageRegistry, LanguageSpec};
pub use process::{effective_timeout, ProcessSandbox, TIMEOUT_EXIT_CODE};
pub use traits::{SandboxRequest, SandboxRunner};
