use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use super::types::{CompletionChunk, CompletionRequest, CompletionResponse, FinishReason};

pub type CompletionStream = Pin<Box<dyn Stream<Item = anyhow::Result<CompletionChunk>> + Send>>;

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse>;

    /// Streamed variant. The default replays `complete` as one text chunk plus `Done`.
    async fn complete_stream(&self, request: &CompletionRequest) -> anyhow::Result<CompletionStream> {
        let response = self.complete(request).await?;
        let chunks = vec![
            Ok(CompletionChunk::Text(response.text)),
            Ok(CompletionChunk::Done {
                finish_reason: response.finish_reason,
                truncated: response.truncated,
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Fold a chunk stream into a single response. A stream that ends without `Done`
/// was cut off and is reported as truncated.
pub async fn collect_stream(mut stream: CompletionStream) -> anyhow::Result<CompletionResponse> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            CompletionChunk::Text(t) => text.push_str(&t),
            CompletionChunk::Done {
                finish_reason,
                truncated,
            } => {
                return Ok(CompletionResponse {
                    text,
                    finish_reason,
                    truncated,
                })
            }
        }
    }
    Ok(CompletionResponse {
        text,
        finish_reason: FinishReason::Other("stream_ended".into()),
        truncated: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Purpose;

    struct Fixed;

    #[async_trait]
    impl CompletionService for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
            Ok(CompletionResponse::length("partial"))
        }
    }

    #[tokio::test]
    async fn default_stream_round_trips_through_collect() {
        let req = CompletionRequest::new(Purpose::Plan, "p");
        let stream = Fixed.complete_stream(&req).await.unwrap();
        let resp = collect_stream(stream).await.unwrap();
        assert_eq!(resp, CompletionResponse::length("partial"));
    }

    #[tokio::test]
    async fn stream_without_done_is_truncated() {
        let stream: CompletionStream = Box::pin(futures::stream::iter(vec![
            Ok(CompletionChunk::Text("a".into())),
            Ok(CompletionChunk::Text("b".into())),
        ]));
        let resp = collect_stream(stream).await.unwrap();
        assert_eq!(resp.text, "ab");
        assert!(resp.truncated);
    }
}
