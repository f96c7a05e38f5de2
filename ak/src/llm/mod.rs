//! LLM provider contract and implementations
//!
//! The runtime consumes providers through the [`Provider`] trait; the
//! embedded agent loop never talks to a vendor API directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

mod anthropic;
mod error;
pub mod mock;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::ProviderError;
pub use types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, MessageContent, ProviderEvent, Role, StopReason,
    TokenUsage, ToolCall, ToolDefinition,
};

use crate::config::LlmConfig;

/// A completion provider
///
/// Each call is independent; no conversation state is kept between calls.
/// `stream` delivers [`ProviderEvent`]s on the supplied channel as they
/// arrive and still returns the assembled final response. Streams are
/// non-restartable: dropping the receiver mid-stream abandons the request.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send a completion request, blocking until the full response is ready
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Streaming completion; events are sent to `event_tx` as they arrive
    async fn stream(
        &self,
        request: CompletionRequest,
        event_tx: mpsc::Sender<ProviderEvent>,
    ) -> Result<CompletionResponse, ProviderError>;
}

/// Create a provider from configuration
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    debug!(provider = %config.provider, model = %config.model, "create_provider: called");
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::from_config(config)?)),
        other => Err(ProviderError::InvalidResponse(format!(
            "Unknown LLM provider: '{}'. Supported: anthropic",
            other
        ))),
    }
}
