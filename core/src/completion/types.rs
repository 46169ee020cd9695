use serde::{Deserialize, Serialize};

use crate::task::StepId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Plan,
    StepCode,
    Repair,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub purpose: Purpose,
    /// Instruction for this turn.
    pub prompt: String,
    /// Compressed working context supplied alongside the prompt.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<StepId>,
    /// Set on continuation requests: the checkpoint sequence this resumes from.
    #[serde(default)]
    pub resume_after: Option<u64>,
}

impl CompletionRequest {
    pub fn new(purpose: Purpose, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            prompt: prompt.into(),
            context: None,
            task_id: None,
            step_id: None,
            resume_after: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = (!context.trim().is_empty()).then_some(context);
        self
    }

    pub fn for_task(mut self, task_id: impl Into<String>, step_id: Option<StepId>) -> Self {
        self.task_id = Some(task_id.into());
        self.step_id = step_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Normalize provider-specific finish reasons.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "stop" | "end_turn" | "stop_sequence" | "eos" => FinishReason::Stop,
            "length" | "max_tokens" | "model_length" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn is_length(&self) -> bool {
        matches!(self, FinishReason::Length)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub finish_reason: FinishReason,
    /// Provider-level truncation flag, independent of `finish_reason`.
    #[serde(default)]
    pub truncated: bool,
}

impl CompletionResponse {
    pub fn stop(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: FinishReason::Stop,
            truncated: false,
        }
    }

    pub fn length(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: FinishReason::Length,
            truncated: false,
        }
    }
}

/// Streamed completion: ordered text chunks, then exactly one `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompletionChunk {
    Text(String),
    Done {
        finish_reason: FinishReason,
        truncated: bool,
    },
}
