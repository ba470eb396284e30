//! VIGIL Tools - Tool/Model Invocation Layer
//!
//! The execution engine treats model and tool calls as an opaque external
//! service. This crate defines that seam ([`ToolInvoker`]), a registry that
//! routes actions to invokers by tool name, an explicit opt-in retry wrapper,
//! the pricing model used for budget accounting, an HTTP client and a
//! scriptable mock.

pub mod http;
pub mod mock;
pub mod pricing;
pub mod retry;

pub use http::{HttpToolConfig, HttpToolInvoker};
pub use mock::MockToolInvoker;
pub use pricing::PricingTable;
pub use retry::RetryingInvoker;

use ::async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use vigil_core::{ToolError, Usd};

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Role of a message sent to a tool or model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeOptions {
    /// Tool or operation name the call is routed by.
    pub tool: String,
    pub model: String,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Caller context forwarded verbatim (execution id, step number, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InvokeOptions {
    pub fn new(tool: impl Into<String>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            tool: tool.into(),
            model: model.into(),
            max_tokens,
            temperature: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Token usage reported by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl ToolUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Result of a completed call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: String,
    #[serde(default)]
    pub usage: ToolUsage,
    /// Cost reported by the tool itself; priced locally when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Usd>,
    /// Project paths the call changed.
    #[serde(default)]
    pub files_modified: Vec<String>,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>, usage: ToolUsage) -> Self {
        Self {
            content: content.into(),
            usage,
            cost: None,
            files_modified: Vec::new(),
        }
    }

    pub fn with_cost(mut self, cost: Usd) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_files_modified(mut self, files: Vec<String>) -> Self {
        self.files_modified = files;
        self
    }
}

/// One item of a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Delta {
        text: String,
    },
    /// Final item: totals for the whole call.
    Done {
        usage: ToolUsage,
        #[serde(default)]
        cost: Option<Usd>,
        #[serde(default)]
        files_modified: Vec<String>,
    },
}

pub type ToolStream = BoxStream<'static, Result<StreamChunk, ToolError>>;

// ============================================================================
// TOOL INVOKER TRAIT
// ============================================================================

/// External tool/model collaborator.
///
/// Errors are classified as retryable or fatal by [`ToolError`]. Callers
/// decide what to do with them; nothing here retries implicitly.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<ToolResponse, ToolError>;

    /// Streaming variant. The default wraps [`ToolInvoker::invoke`] into a
    /// delta followed by the final totals.
    async fn invoke_stream(
        &self,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<ToolStream, ToolError> {
        let response = self.invoke(messages, options).await?;
        let chunks = vec![
            Ok(StreamChunk::Delta {
                text: response.content,
            }),
            Ok(StreamChunk::Done {
                usage: response.usage,
                cost: response.cost,
                files_modified: response.files_modified,
            }),
        ];
        Ok(stream::iter(chunks).boxed())
    }
}

/// Fold a stream into a single response.
///
/// A stream that ends without a `Done` chunk is a retryable failure: the
/// call was cut off and its usage is unknown.
pub async fn collect_stream(tool: &str, mut chunks: ToolStream) -> Result<ToolResponse, ToolError> {
    let mut content = String::new();
    while let Some(chunk) = chunks.next().await {
        match chunk? {
            StreamChunk::Delta { text } => content.push_str(&text),
            StreamChunk::Done {
                usage,
                cost,
                files_modified,
            } => {
                return Ok(ToolResponse {
                    content,
                    usage,
                    cost,
                    files_modified,
                })
            }
        }
    }
    Err(ToolError::retryable(tool, "stream ended before final usage"))
}

// ============================================================================
// TOOL REGISTRY
// ============================================================================

/// Routes calls to invokers by tool name, falling back to a default.
/// Invokers must be explicitly registered.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolInvoker>>,
    default: Option<Arc<dyn ToolInvoker>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry where every tool name resolves to `invoker`.
    pub fn with_default(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            tools: HashMap::new(),
            default: Some(invoker),
        }
    }

    pub fn register(&mut self, tool: impl Into<String>, invoker: Arc<dyn ToolInvoker>) {
        self.tools.insert(tool.into(), invoker);
    }

    pub fn set_default(&mut self, invoker: Arc<dyn ToolInvoker>) {
        self.default = Some(invoker);
    }

    pub fn resolve(&self, tool: &str) -> Result<Arc<dyn ToolInvoker>, ToolError> {
        self.tools
            .get(tool)
            .or(self.default.as_ref())
            .cloned()
            .ok_or(ToolError::NotConfigured)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .field("default", &self.default.as_ref().map(|d| d.name().to_string()))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
