//! HTTP tool invoker with rate limiting

use crate::{InvokeOptions, Message, ToolInvoker, ToolResponse};
use ::async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use vigil_core::ToolError;

/// Connection settings for [`HttpToolInvoker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpToolConfig {
    /// Base URL; calls are POSTed to `{base_url}/invoke`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub requests_per_minute: u32,
    pub timeout_ms: u64,
}

#[derive(Serialize)]
struct InvokeRequest<'a> {
    messages: &'a [Message],
    options: &'a InvokeOptions,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Invoker that forwards calls to a remote tool gateway.
pub struct HttpToolInvoker {
    client: Client,
    name: String,
    config: HttpToolConfig,
    rate_limiter: Arc<Semaphore>,
    last_request: Arc<AtomicU64>,
    min_request_interval_ms: u64,
    start_time: Instant,
}

impl HttpToolInvoker {
    pub fn new(name: impl Into<String>, config: HttpToolConfig) -> Result<Self, ToolError> {
        let name = name.into();
        let rpm = config.requests_per_minute.max(1);
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|e| ToolError::fatal(&name, format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            name,
            rate_limiter: Arc::new(Semaphore::new(rpm as usize)),
            last_request: Arc::new(AtomicU64::new(0)),
            min_request_interval_ms: (60_000 / rpm as u64).max(10),
            start_time: Instant::now(),
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/invoke", self.config.base_url.trim_end_matches('/'))
    }

    async fn throttle(&self) {
        let now_ms = self.start_time.elapsed().as_millis() as u64;
        let last_ms = self.last_request.load(Ordering::Relaxed);
        let elapsed = now_ms.saturating_sub(last_ms);

        if last_ms != 0 && elapsed < self.min_request_interval_ms {
            let wait_ms = self.min_request_interval_ms - elapsed;
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }

        self.last_request
            .store(self.start_time.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

/// Map a non-success status to the error taxonomy: throttling and server
/// errors are worth retrying, other client errors are not.
pub(crate) fn classify_status(
    tool: &str,
    status: StatusCode,
    message: String,
    retry_after_ms: Option<u64>,
) -> ToolError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ToolError::Retryable {
            tool: tool.to_string(),
            message: format!("{}: {}", status.as_u16(), message),
            retry_after_ms,
        }
    } else {
        ToolError::fatal(tool, format!("{}: {}", status.as_u16(), message))
    }
}

pub(crate) fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(|seconds| (seconds * 1000.0) as u64)
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<ToolResponse, ToolError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ToolError::fatal(&self.name, format!("Rate limiter error: {}", e)))?;
        self.throttle().await;

        let mut request = self
            .client
            .post(self.endpoint())
            .json(&InvokeRequest { messages, options });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        tracing::debug!(tool = %self.name, target_tool = %options.tool, "sending tool request");
        let response = request.send().await.map_err(|e| ToolError::Retryable {
            tool: self.name.clone(),
            message: format!("HTTP request failed: {}", e),
            retry_after_ms: None,
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<ToolResponse>().await.map_err(|e| {
                ToolError::fatal(&self.name, format!("Failed to parse response: {}", e))
            });
        }

        let retry_after_ms = parse_retry_after_ms(response.headers());
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = match serde_json::from_str::<ErrorBody>(&error_text) {
            Ok(body) => body.message.or(body.error).unwrap_or(error_text),
            Err(_) => error_text,
        };
        Err(classify_status(&self.name, status, message, retry_after_ms))
    }
}

impl std::fmt::Debug for HttpToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpToolInvoker")
            .field("name", &self.name)
            .field("base_url", &self.config.base_url)
            .field("api_key", &self.config.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
