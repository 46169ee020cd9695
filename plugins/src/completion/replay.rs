use std::collections::VecDeque;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use autopilot_core::api::{
    CompletionRequest, CompletionResponse, CompletionService, FinishReason, Purpose,
};

/// One scripted reply. `purpose`, when present, restricts which requests may consume it.
#[derive(Debug, Clone, Deserialize)]
struct ReplayEntry {
    #[serde(default)]
    purpose: Option<Purpose>,
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    truncated: bool,
}

impl ReplayEntry {
    fn into_response(self) -> CompletionResponse {
        CompletionResponse {
            text: self.text,
            finish_reason: self
                .finish_reason
                .as_deref()
                .map(FinishReason::parse)
                .unwrap_or(FinishReason::Stop),
            truncated: self.truncated,
        }
    }
}

/// Completion service that replays responses from a JSONL file, in order.
///
/// Used for offline runs and reproducing a recorded session.
pub struct ReplayCompletionService {
    entries: Mutex<VecDeque<ReplayEntry>>,
}

impl ReplayCompletionService {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        Self::from_jsonl(&content)
    }

    pub fn from_jsonl(content: &str) -> Result<Self> {
        let mut entries = VecDeque::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(line)
                .with_context(|| format!("invalid replay entry on line {}", idx + 1))?;
            entries.push_back(entry);
        }
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    pub async fn remaining(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl CompletionService for ReplayCompletionService {
    fn name(&self) -> &str {
        "replay"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let mut entries = self.entries.lock().await;
        let pos = entries
            .iter()
            .position(|e| e.purpose.is_none() || e.purpose == Some(request.purpose))
            .ok_or_else(|| anyhow!("replay exhausted for {:?} request", request.purpose))?;
        let entry = entries
            .remove(pos)
            .ok_or_else(|| anyhow!("replay entry vanished"))?;
        Ok(entry.into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCRIPT: &str = r#"
# planner
{"purpose": "plan", "text": "{\"steps\": [", "finish_reason": "length"}
{"text": "```python\nprint(1)\n```"}
{"purpose": "resume", "text": "]}"}
"#;

    #[tokio::test]
    async fn replays_in_order_honouring_purpose() {
        let svc = ReplayCompletionService::from_jsonl(SCRIPT).unwrap();
        assert_eq!(svc.remaining().await, 3);

        let plan = svc
            .complete(&CompletionRequest::new(Purpose::Plan, "p"))
            .await
            .unwrap();
        assert_eq!(plan.finish_reason, FinishReason::Length);

        // The resume entry is skipped over by a step request.
        let code = svc
            .complete(&CompletionRequest::new(Purpose::StepCode, "s"))
            .await
            .unwrap();
        assert_eq!(code.text, "```python\nprint(1)\n```");

        let resume = svc
            .complete(&CompletionRequest::new(Purpose::Resume, "r"))
            .await
            .unwrap();
        assert_eq!(resume, CompletionResponse::stop("]}"));

        assert!(svc
            .complete(&CompletionRequest::new(Purpose::Repair, "x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reads_from_file_and_reports_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.jsonl");
        tokio::fs::write(&path, "{\"text\": \"ok\"}\nnot json\n")
            .await
            .unwrap();
        let err = ReplayCompletionService::from_file(&path).await.err().unwrap();
        assert!(err.to_string().contains("line 2"));
    }
}
