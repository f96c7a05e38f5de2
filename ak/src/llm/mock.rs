//! Scripted provider for tests
//!
//! Returns pre-canned responses in order. The streaming path replays each
//! response as text-delta / tool-call events so loop and session plumbing can
//! be exercised without a network.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionRequest, CompletionResponse, Provider, ProviderError, ProviderEvent, StopReason, TokenUsage};

/// Scripted provider returning canned responses in order
pub struct MockProvider {
    responses: Mutex<Vec<CompletionResponse>>,
    call_count: AtomicUsize,
    /// Replay the final response forever instead of erroring when exhausted
    repeat_last: bool,
}

impl MockProvider {
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: AtomicUsize::new(0),
            repeat_last: false,
        }
    }

    /// Convenience: a provider that answers every request with `text`
    pub fn always_text(text: impl Into<String>) -> Self {
        let mut provider = Self::new(vec![CompletionResponse {
            content: Some(text.into()),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        }]);
        provider.repeat_last = true;
        provider
    }

    /// Build a plain-text end-turn response for scripting
    pub fn text_response(text: impl Into<String>) -> CompletionResponse {
        CompletionResponse {
            content: Some(text.into()),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        }
    }

    /// Build a tool-use response for scripting
    pub fn tool_response(calls: Vec<super::ToolCall>) -> CompletionResponse {
        CompletionResponse {
            content: None,
            tool_calls: calls,
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage::default(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> Result<CompletionResponse, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        if self.repeat_last
            && let Some(last) = responses.last()
            && idx >= responses.len()
        {
            return Ok(last.clone());
        }
        responses
            .get(idx)
            .cloned()
            .ok_or_else(|| ProviderError::InvalidResponse("No more scripted responses".to_string()))
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.next_response()
    }

    async fn stream(
        &self,
        _request: CompletionRequest,
        event_tx: mpsc::Sender<ProviderEvent>,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.next_response()?;

        if let Some(text) = &response.content {
            let _ = event_tx.send(ProviderEvent::TextDelta(text.clone())).await;
        }
        for call in &response.tool_calls {
            let _ = event_tx
                .send(ProviderEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.input.clone(),
                })
                .await;
        }
        let _ = event_tx
            .send(ProviderEvent::Usage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            })
            .await;
        let _ = event_tx.send(ProviderEvent::Done).await;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;

    fn request() -> CompletionRequest {
        CompletionRequest {
            system_prompt: "test".to_string(),
            messages: vec![],
            tools: vec![],
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let provider = MockProvider::new(vec![
            MockProvider::text_response("first"),
            MockProvider::text_response("second"),
        ]);

        let a = provider.complete(request()).await.unwrap();
        let b = provider.complete(request()).await.unwrap();
        assert_eq!(a.content.as_deref(), Some("first"));
        assert_eq!(b.content.as_deref(), Some("second"));
        assert_eq!(provider.call_count(), 2);

        assert!(provider.complete(request()).await.is_err());
    }

    #[tokio::test]
    async fn test_always_text_repeats() {
        let provider = MockProvider::always_text("Hello!");
        for _ in 0..3 {
            let response = provider.complete(request()).await.unwrap();
            assert_eq!(response.content.as_deref(), Some("Hello!"));
        }
    }

    #[tokio::test]
    async fn test_stream_replays_events() {
        let provider = MockProvider::new(vec![MockProvider::tool_response(vec![ToolCall {
            id: "tc_1".to_string(),
            name: "write".to_string(),
            input: serde_json::json!({"path": "a"}),
        }])]);

        let (tx, mut rx) = mpsc::channel(16);
        provider.stream(request(), tx).await.unwrap();

        let mut saw_tool_call = false;
        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                ProviderEvent::ToolCall { name, .. } => {
                    assert_eq!(name, "write");
                    saw_tool_call = true;
                }
                ProviderEvent::Done => saw_done = true,
                _ => {}
            }
        }
        assert!(saw_tool_call);
        assert!(saw_done);
    }
}
