//! Completion provider implementations

pub mod anthropic;
pub mod openai;

pub use anthropic::{AnthropicClient, AnthropicCompletionProvider};
pub use openai::{OpenAIClient, OpenAICompletionProvider};

use callctx_core::{CallctxError, CallctxResult, LlmError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};

pub(crate) fn request_failed(provider: &str, status: i32, message: impl Into<String>) -> CallctxError {
    CallctxError::Llm(LlmError::RequestFailed {
        provider: provider.to_string(),
        status,
        message: message.into(),
    })
}

pub(crate) fn rate_limited(provider: &str, retry_after_ms: i64) -> CallctxError {
    CallctxError::Llm(LlmError::RateLimited {
        provider: provider.to_string(),
        retry_after_ms,
    })
}

pub(crate) fn invalid_response(provider: &str, reason: impl Into<String>) -> CallctxError {
    CallctxError::Llm(LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: reason.into(),
    })
}

pub(crate) fn transport_failed(provider: &str, timeout: Duration, e: reqwest::Error) -> CallctxError {
    if e.is_timeout() {
        return CallctxError::Llm(LlmError::Timeout {
            provider: provider.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        });
    }
    request_failed(provider, 0, format!("HTTP request failed: {}", e))
}

pub(crate) fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<i64> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<f64>().ok())
        .map(|seconds| (seconds * 1000.0) as i64)
}

/// Concurrency cap plus a minimum spacing between requests.
pub(crate) struct RequestPacer {
    permits: Arc<Semaphore>,
    last_request: Arc<AtomicU64>,
    min_interval_ms: u64,
    start_time: Instant,
}

impl RequestPacer {
    pub(crate) fn per_minute(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self {
            permits: Arc::new(Semaphore::new(rpm as usize)),
            last_request: Arc::new(AtomicU64::new(0)),
            min_interval_ms: (60_000 / rpm as u64).max(10),
            start_time: Instant::now(),
        }
    }

    /// Wait for a permit and for the spacing window, then stamp the request.
    pub(crate) async fn acquire(&self, provider: &str) -> CallctxResult<SemaphorePermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| request_failed(provider, 0, format!("Rate limiter error: {}", e)))?;

        let now_ms = self.start_time.elapsed().as_millis() as u64;
        let last_ms = self.last_request.load(Ordering::Relaxed);
        let elapsed = now_ms.saturating_sub(last_ms);
        if last_ms > 0 && elapsed < self.min_interval_ms {
            tokio::time::sleep(Duration::from_millis(self.min_interval_ms - elapsed)).await;
        }
        self.last_request
            .store(self.start_time.elapsed().as_millis().max(1) as u64, Ordering::Relaxed);
        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1.5"));
        assert_eq!(parse_retry_after_ms(&headers), Some(1500));
    }

    #[test]
    fn test_parse_retry_after_missing_or_garbage() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after_ms(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after_ms(&headers), None);
    }

    #[tokio::test]
    async fn test_pacer_spaces_requests() {
        let pacer = RequestPacer::per_minute(600);
        let started = Instant::now();
        drop(pacer.acquire("test").await.unwrap());
        drop(pacer.acquire("test").await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(90));
    }
}
