//! Explicit retry policy around an invoker.
//!
//! The step scheduler never retries. Deployments that want retries wrap
//! their invoker in [`RetryingInvoker`], which retries only errors classified
//! as retryable, with exponential backoff capped at `max_backoff`.

use crate::{InvokeOptions, Message, ToolInvoker, ToolResponse};
use ::async_trait::async_trait;
use std::time::Duration;
use vigil_core::{RetryConfig, ToolError};

pub struct RetryingInvoker<I> {
    inner: I,
    config: RetryConfig,
}

impl<I: ToolInvoker> RetryingInvoker<I> {
    pub fn new(inner: I, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    /// Delay before retry number `attempt` (1-based). A server-supplied
    /// `retry_after_ms` wins when it is longer.
    pub fn backoff_for(&self, attempt: u32, err: &ToolError) -> Duration {
        let base = self.config.initial_backoff().as_millis() as f64;
        let factor = (self.config.backoff_multiplier as f64).powi(attempt.saturating_sub(1) as i32);
        let computed = Duration::from_millis((base * factor).min(u64::MAX as f64) as u64)
            .min(self.config.max_backoff());
        match err.retry_after_ms() {
            Some(ms) => computed.max(Duration::from_millis(ms)),
            None => computed,
        }
    }
}

#[async_trait]
impl<I: ToolInvoker> ToolInvoker for RetryingInvoker<I> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(
        &self,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<ToolResponse, ToolError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.invoke(messages, options).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.backoff_for(attempt, &err);
                    tracing::warn!(
                        tool = %self.inner.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying tool invocation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<I> std::fmt::Debug for RetryingInvoker<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingInvoker")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockToolInvoker, ToolUsage};

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            backoff_multiplier: 2.0,
        }
    }

    fn options() -> InvokeOptions {
        InvokeOptions::new("llm", "m", 16)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_until_success() {
        let mock = MockToolInvoker::new("llm");
        mock.push_error(ToolError::retryable("llm", "503"));
        mock.push_error(ToolError::retryable("llm", "503"));
        mock.push_response(ToolResponse::text("ok", ToolUsage::new(1, 1)));

        let invoker = RetryingInvoker::new(mock, config(3));
        let response = invoker.invoke(&[Message::user("hi")], &options()).await.unwrap();

        assert_eq!(response.content, "ok");
        assert_eq!(invoker.inner().call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let mock = MockToolInvoker::new("llm");
        mock.push_error(ToolError::fatal("llm", "400"));

        let invoker = RetryingInvoker::new(mock, config(3));
        let err = invoker.invoke(&[], &options()).await.unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(invoker.inner().call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let mock = MockToolInvoker::new("llm");
        for _ in 0..5 {
            mock.push_error(ToolError::retryable("llm", "timeout"));
        }

        let invoker = RetryingInvoker::new(mock, config(2));
        assert!(invoker.invoke(&[], &options()).await.is_err());
        assert_eq!(invoker.inner().call_count(), 3);
    }

    #[test]
    fn test_backoff_is_capped_and_honours_retry_after() {
        let invoker = RetryingInvoker::new(MockToolInvoker::new("llm"), config(5));
        let plain = ToolError::retryable("llm", "x");
        assert_eq!(invoker.backoff_for(1, &plain), Duration::from_millis(10));
        assert_eq!(invoker.backoff_for(2, &plain), Duration::from_millis(20));
        assert_eq!(invoker.backoff_for(5, &plain), Duration::from_millis(40));

        let throttled = ToolError::Retryable {
            tool: "llm".to_string(),
            message: "429".to_string(),
            retry_after_ms: Some(1_000),
        };
        assert_eq!(invoker.backoff_for(1, &throttled), Duration::from_millis(1_000));
    }
}
