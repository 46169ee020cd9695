use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::history::{ExecutionRecord, RecordLabels};

use super::io_pump::OutputLine;

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub language: String,
    pub code: String,
    pub timeout: Duration,
    /// Working directory shared by the steps of one task. A scratch dir when unset.
    pub workdir: Option<PathBuf>,
    pub labels: RecordLabels,
    /// Live line forwarding.
    pub follow: Option<mpsc::Sender<OutputLine>>,
}

impl SandboxRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>, timeout: Duration) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            timeout,
            workdir: None,
            labels: RecordLabels::default(),
            follow: None,
        }
    }

    pub fn in_dir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn labelled(mut self, labels: RecordLabels) -> Self {
        self.labels = labels;
        self
    }
}

/// Runs one snippet to completion. A failed run is an `Ok` record with `success=false`;
/// `Err` is reserved for requests that cannot be attempted at all.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, language: &str) -> bool;
    async fn run(
        &self,
        request: SandboxRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord, EngineError>;
}
