use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use autopilot_core::api::{
    collect_stream, CompletionChunk, CompletionRequest, CompletionResponse, CompletionService,
    CompletionStream, FinishReason, HttpCompletionConfig, Purpose,
};

const SYSTEM_PROMPT: &str = "You are an autonomous software agent. \
Answer with runnable code in a single fenced block unless asked for JSON.";

/// OpenAI-compatible chat completion client (`POST {base_url}/chat/completions`).
pub struct HttpCompletionService {
    client: reqwest::Client,
    cfg: HttpCompletionConfig,
}

impl HttpCompletionService {
    pub fn new(cfg: HttpCompletionConfig) -> Result<Self> {
        if !(cfg.base_url.starts_with("http://") || cfg.base_url.starts_with("https://")) {
            return Err(anyhow!(
                "completion base_url must be a URL (http/https), got: {}",
                cfg.base_url
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, cfg })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'))
    }

    fn payload(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];
        if let Some(context) = &request.context {
            messages.push(json!({
                "role": "system",
                "content": format!("Working context:\n{context}"),
            }));
        }
        if request.purpose == Purpose::Resume {
            messages.push(json!({
                "role": "system",
                "content": "Continue exactly where the previous reply stopped. Do not repeat earlier output.",
            }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        json!({
            "model": self.cfg.model,
            "messages": messages,
            "temperature": self.cfg.temperature,
            "max_tokens": self.cfg.max_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let mut builder = self.client.post(self.endpoint()).json(&self.payload(request, stream));
        if !self.cfg.api_key.is_empty() {
            builder = builder.bearer_auth(&self.cfg.api_key);
        }

        tracing::debug!(
            target: "autopilot.flow",
            purpose = ?request.purpose,
            model = %self.cfg.model,
            stream,
            "completion request"
        );
        let resp = builder.send().await.context("completion request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "completion HTTP {}: {}",
                status.as_u16(),
                body.trim_end()
            ));
        }
        Ok(resp)
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if self.cfg.stream {
            let stream = self.complete_stream(request).await?;
            return collect_stream(stream).await;
        }
        let body: Value = self
            .send(request, false)
            .await?
            .json()
            .await
            .context("completion response was not JSON")?;
        parse_response(&body)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let resp = self.send(request, true).await?;
        let mut bytes = resp.bytes_stream();

        Ok(Box::pin(async_stream::try_stream! {
            let mut buffer = String::new();
            let mut finish: Option<FinishReason> = None;

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.context("completion stream read failed")?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    match parse_sse_line(&line) {
                        Some(SseEvent::Delta { text, finish_reason }) => {
                            if let Some(reason) = finish_reason {
                                finish = Some(reason);
                            }
                            if !text.is_empty() {
                                yield CompletionChunk::Text(text);
                            }
                        }
                        Some(SseEvent::Done) => {
                            yield CompletionChunk::Done {
                                finish_reason: finish.take().unwrap_or(FinishReason::Stop),
                                truncated: false,
                            };
                            return;
                        }
                        None => {}
                    }
                }
            }

            // Connection closed without `[DONE]`: only trust an explicit finish reason.
            if let Some(reason) = finish {
                yield CompletionChunk::Done { finish_reason: reason, truncated: false };
            }
        }))
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta {
        text: String,
        finish_reason: Option<FinishReason>,
    },
    Done,
}

fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let value: Value = serde_json::from_str(data).ok()?;
    let choice = value.get("choices")?.get(0)?;
    let text = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::parse);
    Some(SseEvent::Delta {
        text,
        finish_reason,
    })
}

fn parse_response(body: &Value) -> Result<CompletionResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| anyhow!("completion response has no choices"))?;
    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .or_else(|| choice.get("text").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::parse)
        .unwrap_or(FinishReason::Stop);
    let truncated = body
        .get("truncated")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(CompletionResponse {
        text,
        finish_reason,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn service() -> HttpCompletionService {
        HttpCompletionService::new(HttpCompletionConfig {
            base_url: "http://localhost:9/v1/".into(),
            ..HttpCompletionConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn rejects_non_url_base() {
        let cfg = HttpCompletionConfig {
            base_url: "localhost".into(),
            ..HttpCompletionConfig::default()
        };
        assert!(HttpCompletionService::new(cfg).is_err());
    }

    #[test]
    fn payload_carries_context_and_resume_hint() {
        let svc = service();
        assert_eq!(svc.endpoint(), "http://localhost:9/v1/chat/completions");

        let req = CompletionRequest::new(Purpose::Resume, "go on").with_context("goal: x");
        let body = svc.payload(&req, true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["content"], "Working context:\ngoal: x");
        assert_eq!(messages[3]["role"], "user");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn parses_openai_reply_with_length_finish() {
        let body = json!({
            "choices": [{ "message": { "content": "```python\nprint(" }, "finish_reason": "length" }]
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.text, "```python\nprint(");
        assert_eq!(resp.finish_reason, FinishReason::Length);
        assert!(parse_response(&json!({})).is_err());
    }

    #[test]
    fn sse_lines_map_to_deltas_and_done() {
        assert_eq!(
            parse_sse_line("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n"),
            Some(SseEvent::Delta {
                text: "hi".into(),
                finish_reason: None
            })
        );
        assert_eq!(
            parse_sse_line("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"max_tokens\"}]}"),
            Some(SseEvent::Delta {
                text: String::new(),
                finish_reason: Some(FinishReason::Length)
            })
        );
        assert_eq!(parse_sse_line("data: [DONE]\r\n"), Some(SseEvent::Done));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("event: ping"), None);
    }
}
