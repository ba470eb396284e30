//! Scriptable invoker for tests and local runs.

use crate::{
    collect_stream, InvokeOptions, Message, StreamChunk, ToolInvoker, ToolResponse, ToolStream,
    ToolUsage,
};
use ::async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use vigil_core::ToolError;

/// A recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub options: InvokeOptions,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<Result<ToolResponse, ToolError>>,
    calls: Vec<RecordedCall>,
}

/// Replays queued results in order, then a default response.
///
/// Responses are streamed natively word by word; [`ToolInvoker::invoke`]
/// collects that stream, so both paths see the same script. Clones share
/// state, which lets a test keep a handle after boxing the invoker.
#[derive(Debug, Clone)]
pub struct MockToolInvoker {
    name: String,
    default_response: ToolResponse,
    state: Arc<Mutex<MockState>>,
}

impl MockToolInvoker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_response: ToolResponse::text("ok", ToolUsage::new(10, 10)),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_default_response(mut self, response: ToolResponse) -> Self {
        self.default_response = response;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_response(&self, response: ToolResponse) {
        self.state().script.push_back(Ok(response));
    }

    pub fn push_error(&self, error: ToolError) {
        self.state().script.push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    fn next_result(&self, messages: &[Message], options: &InvokeOptions) -> Result<ToolResponse, ToolError> {
        let mut state = self.state();
        state.calls.push(RecordedCall {
            messages: messages.to_vec(),
            options: options.clone(),
        });
        state
            .script
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_response.clone()))
    }
}

#[async_trait]
impl ToolInvoker for MockToolInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<ToolResponse, ToolError> {
        let chunks = self.invoke_stream(messages, options).await?;
        collect_stream(&self.name, chunks).await
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<ToolStream, ToolError> {
        let response = self.next_result(messages, options)?;
        let mut chunks: Vec<Result<StreamChunk, ToolError>> = response
            .content
            .split_inclusive(' ')
            .map(|word| {
                Ok(StreamChunk::Delta {
                    text: word.to_string(),
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk::Done {
            usage: response.usage,
            cost: response.cost,
            files_modified: response.files_modified,
        }));
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::Usd;

    fn options() -> InvokeOptions {
        InvokeOptions::new("llm", "m", 32)
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockToolInvoker::new("llm");
        mock.push_response(
            ToolResponse::text("first answer", ToolUsage::new(1, 2)).with_cost(Usd::from_cents(1)),
        );

        let first = mock.invoke(&[Message::user("a")], &options()).await.unwrap();
        let second = mock.invoke(&[Message::user("b")], &options()).await.unwrap();

        assert_eq!(first.content, "first answer");
        assert_eq!(first.cost, Some(Usd::from_cents(1)));
        assert_eq!(second.content, "ok");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.calls()[1].messages[0].content, "b");
    }

    #[tokio::test]
    async fn test_stream_yields_words_then_totals() {
        let mock = MockToolInvoker::new("llm");
        mock.push_response(ToolResponse::text("one two three", ToolUsage::new(3, 3)));

        let chunks: Vec<_> = mock
            .invoke_stream(&[], &options())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 4);
        assert!(matches!(chunks.last(), Some(Ok(StreamChunk::Done { .. }))));
    }

    #[tokio::test]
    async fn test_scripted_error_is_returned() {
        let mock = MockToolInvoker::new("llm");
        mock.push_error(ToolError::fatal("llm", "nope"));
        assert!(mock.invoke(&[], &options()).await.is_err());
    }

    #[tokio::test]
    async fn test_clones_share_script() {
        let mock = MockToolInvoker::new("llm");
        let handle = mock.clone();
        handle.push_response(ToolResponse::text("shared", ToolUsage::default()));
        assert_eq!(mock.invoke(&[], &options()).await.unwrap().content, "shared");
        assert_eq!(handle.call_count(), 1);
    }
}
