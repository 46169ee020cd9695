use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::EngineError;

use super::traits::CompletionService;
use super::types::{CompletionRequest, CompletionResponse};

/// Exponential backoff for transient completion-service errors.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before retry number `attempt` (0-based), or `None` once attempts are spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt.saturating_add(1) >= self.max_attempts() {
            return None;
        }
        let exp = 1u64 << attempt.min(30);
        let delay = self.config.base_delay_ms.saturating_mul(exp);
        Some(Duration::from_millis(delay.min(self.config.max_delay_ms)))
    }
}

/// Call the service, retrying transport failures with backoff. Cancellation wins over
/// both the call and the sleep.
pub async fn complete_with_retry(
    service: &dyn CompletionService,
    request: &CompletionRequest,
    backoff: &Backoff,
    cancel: &CancellationToken,
) -> Result<CompletionResponse, EngineError> {
    let mut attempt = 0u32;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            r = service.complete(request) => r,
        };
        match result {
            Ok(resp) => return Ok(resp),
            Err(err) => {
                let Some(delay) = backoff.next_delay(attempt) else {
                    tracing::error!(
                        service = service.name(),
                        purpose = ?request.purpose,
                        attempts = attempt + 1,
                        error.kind = "completion",
                        error.message = %err,
                        "completion failed"
                    );
                    return Err(EngineError::Completion(format!("{err:#}")));
                };
                tracing::warn!(
                    service = service.name(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "completion failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Purpose;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cfg(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 250,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::new(cfg(4));
        assert_eq!(b.next_delay(0), Some(Duration::from_millis(100)));
        assert_eq!(b.next_delay(1), Some(Duration::from_millis(200)));
        assert_eq!(b.next_delay(2), Some(Duration::from_millis(250)));
        assert_eq!(b.next_delay(3), None);
        assert_eq!(Backoff::new(cfg(0)).max_attempts(), 1);
    }

    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionService for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _r: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("connection reset");
            }
            Ok(CompletionResponse::stop("ok"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_within_bounds() {
        let svc = Flaky {
            fail_first: 2,
            calls: AtomicU32::new(0),
        };
        let req = CompletionRequest::new(Purpose::Repair, "fix");
        let token = CancellationToken::new();

        let resp = complete_with_retry(&svc, &req, &Backoff::new(cfg(3)), &token)
            .await
            .unwrap();
        assert_eq!(resp.text, "ok");

        let svc = Flaky {
            fail_first: 5,
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retry(&svc, &req, &Backoff::new(cfg(3)), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Completion(_)));
        assert_eq!(svc.calls.load(Ordering::SeqCst), 3);
    }
}
