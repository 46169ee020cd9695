use serde::{Deserialize, Serialize};

use crate::completion::CompletionResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    FinishLength,
    ProviderFlag,
    UnclosedCodeFence,
    UnclosedToolCall,
    UnbalancedJson,
}

impl std::fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TruncationReason::FinishLength => "finish_reason=length",
            TruncationReason::ProviderFlag => "provider truncation flag",
            TruncationReason::UnclosedCodeFence => "unclosed code fence",
            TruncationReason::UnclosedToolCall => "unclosed tool call",
            TruncationReason::UnbalancedJson => "unbalanced JSON",
        })
    }
}

/// First matching reason, checked in a fixed order: finish reason, provider flag,
/// code fence, tool call, JSON.
pub fn detect_truncation(response: &CompletionResponse) -> Option<TruncationReason> {
    if response.finish_reason.is_length() {
        return Some(TruncationReason::FinishLength);
    }
    if response.truncated {
        return Some(TruncationReason::ProviderFlag);
    }
    let text = response.text.as_str();
    if has_unclosed_fence(text) {
        return Some(TruncationReason::UnclosedCodeFence);
    }
    if has_unclosed_tool_call(text) {
        return Some(TruncationReason::UnclosedToolCall);
    }
    if has_unbalanced_json(text) {
        return Some(TruncationReason::UnbalancedJson);
    }
    None
}

fn has_unclosed_fence(text: &str) -> bool {
    let fences = text
        .lines()
        .filter(|l| l.trim_start().starts_with("```"))
        .count();
    fences % 2 == 1
}

fn has_unclosed_tool_call(text: &str) -> bool {
    text.matches("<tool_call>").count() > text.matches("</tool_call>").count()
}

/// Only replies that are themselves JSON are checked; prose with stray braces is not.
fn has_unbalanced_json(text: &str) -> bool {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return false;
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return false;
    }

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            _ => {}
        }
    }
    in_string || depth > 0
}
