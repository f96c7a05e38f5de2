//! Anthropic Messages API provider
//!
//! Implements the [`Provider`] trait with blocking and streaming (SSE)
//! completions.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, MessageContent, Provider, ProviderError,
    ProviderEvent, StopReason, TokenUsage, ToolCall,
};
use crate::config::LlmConfig;

/// Anthropic Messages API provider
pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
}

impl AnthropicProvider {
    /// Create a provider from configuration
    ///
    /// Reads the API key from the environment variable named in config.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ProviderError::InvalidResponse(format!("Environment variable {} not set", config.api_key_env))
        })?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
        })
    }

    /// Build the request body for the Messages API
    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "system": request.system_prompt,
            "messages": convert_messages(&request.messages),
        });

        if !request.tools.is_empty() {
            body["tools"] =
                serde_json::json!(request.tools.iter().map(|t| t.to_wire_schema()).collect::<Vec<_>>());
        }

        body
    }

    /// Classify a non-success HTTP response into a provider error
    async fn classify_http_error(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return ProviderError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            };
        }

        let text = response.text().await.unwrap_or_default();

        if status == 404 && text.contains("model") {
            return ProviderError::ModelNotFound(self.model.clone());
        }

        if status == 400 && (text.contains("prompt is too long") || text.contains("context")) {
            // The API reports "N tokens > M maximum"; fish both numbers out when present
            let (requested, max) = parse_context_overflow(&text).unwrap_or((0, 0));
            return ProviderError::ContextExceeded { max, requested };
        }

        if status >= 500 {
            return ProviderError::Unavailable(format!("HTTP {}: {}", status, text));
        }

        ProviderError::Api { status, message: text }
    }
}

/// Convert internal messages to the Messages API format
fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            let content = match &msg.content {
                MessageContent::Text(text) => serde_json::json!(text),
                MessageContent::Blocks(blocks) => {
                    serde_json::json!(blocks.iter().map(convert_content_block).collect::<Vec<_>>())
                }
            };

            serde_json::json!({
                "role": msg.role,
                "content": content,
            })
        })
        .collect()
}

fn convert_content_block(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({
            "type": "text",
            "text": text,
        }),
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

/// Extract `(requested, max)` token counts from a context-overflow message
fn parse_context_overflow(text: &str) -> Option<(u64, u64)> {
    let mut numbers = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u64>().ok());
    let requested = numbers.next()?;
    let max = numbers.next()?;
    Some((requested, max))
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireContentBlock>,
    stop_reason: String,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

fn parse_response(api_response: WireResponse) -> CompletionResponse {
    let mut content = None;
    let mut tool_calls = Vec::new();

    for block in api_response.content {
        match block {
            WireContentBlock::Text { text } => {
                content = Some(text);
            }
            WireContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall { id, name, input });
            }
        }
    }

    CompletionResponse {
        content,
        tool_calls,
        stop_reason: StopReason::from_wire(&api_response.stop_reason),
        usage: TokenUsage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        },
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);

        let response = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.classify_http_error(response).await);
        }

        let api_response: WireResponse = response.json().await?;
        Ok(parse_response(api_response))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        event_tx: mpsc::Sender<ProviderEvent>,
    ) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut body = self.build_request_body(&request);
        body["stream"] = serde_json::json!(true);

        let http_request = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body);

        let mut es = EventSource::new(http_request).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let mut full_content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut current_tool: Option<(String, String, String)> = None; // (id, name, json_acc)
        let mut stop_reason = StopReason::EndTurn;
        let mut usage = TokenUsage::default();

        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    let data: serde_json::Value = serde_json::from_str(&msg.data).map_err(ProviderError::Json)?;

                    match data["type"].as_str() {
                        Some("message_start") => {
                            if let Some(tokens) = data["message"]["usage"]["input_tokens"].as_u64() {
                                usage.input_tokens = tokens;
                            }
                        }
                        Some("content_block_start") => {
                            if let Some(block) = data.get("content_block")
                                && block["type"] == "tool_use"
                            {
                                let id = block["id"].as_str().unwrap_or("").to_string();
                                let name = block["name"].as_str().unwrap_or("").to_string();
                                current_tool = Some((id, name, String::new()));
                            }
                        }
                        Some("content_block_delta") => {
                            if let Some(delta) = data.get("delta") {
                                if let Some(text) = delta["text"].as_str() {
                                    full_content.push_str(text);
                                    let _ = event_tx.send(ProviderEvent::TextDelta(text.to_string())).await;
                                }
                                if let Some(json) = delta["partial_json"].as_str()
                                    && let Some((_, _, ref mut acc)) = current_tool
                                {
                                    acc.push_str(json);
                                }
                            }
                        }
                        Some("content_block_stop") => {
                            if let Some((id, name, json)) = current_tool.take() {
                                let input: serde_json::Value =
                                    serde_json::from_str(&json).unwrap_or(serde_json::json!({}));
                                let _ = event_tx
                                    .send(ProviderEvent::ToolCall {
                                        id: id.clone(),
                                        name: name.clone(),
                                        arguments: input.clone(),
                                    })
                                    .await;
                                tool_calls.push(ToolCall { id, name, input });
                            }
                        }
                        Some("message_delta") => {
                            if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                                stop_reason = StopReason::from_wire(reason);
                            }
                            if let Some(tokens) = data["usage"]["output_tokens"].as_u64() {
                                usage.output_tokens = tokens;
                            }
                        }
                        Some("message_stop") => {
                            es.close();
                            break;
                        }
                        Some("error") => {
                            let message = data["error"]["message"].as_str().unwrap_or("unknown").to_string();
                            es.close();
                            return Err(ProviderError::Api { status: 0, message });
                        }
                        _ => {
                            debug!(event_type = ?data["type"], "AnthropicProvider::stream: skipping event");
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    es.close();
                    return Err(ProviderError::Unavailable(e.to_string()));
                }
            }
        }

        let _ = event_tx
            .send(ProviderEvent::Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            })
            .await;
        let _ = event_tx.send(ProviderEvent::Done).await;

        Ok(CompletionResponse {
            content: if full_content.is_empty() { None } else { Some(full_content) },
            tool_calls,
            stop_reason,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_messages_text() {
        let messages = vec![Message::user("hello")];
        let wire = convert_messages(&messages);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"], "hello");
    }

    #[test]
    fn test_convert_messages_blocks() {
        let messages = vec![Message::assistant_blocks(vec![
            ContentBlock::text("thinking"),
            ContentBlock::ToolUse {
                id: "t1".to_string(),
                name: "read".to_string(),
                input: serde_json::json!({"path": "a.txt"}),
            },
        ])];
        let wire = convert_messages(&messages);
        assert_eq!(wire[0]["content"][0]["type"], "text");
        assert_eq!(wire[0]["content"][1]["type"], "tool_use");
        assert_eq!(wire[0]["content"][1]["name"], "read");
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let wire = WireResponse {
            content: vec![
                WireContentBlock::Text {
                    text: "Let me check".to_string(),
                },
                WireContentBlock::ToolUse {
                    id: "tc_1".to_string(),
                    name: "read".to_string(),
                    input: serde_json::json!({"path": "x"}),
                },
            ],
            stop_reason: "tool_use".to_string(),
            usage: WireUsage {
                input_tokens: 12,
                output_tokens: 8,
            },
        };

        let response = parse_response(wire);
        assert_eq!(response.content.as_deref(), Some("Let me check"));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "read");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 12);
    }

    #[test]
    fn test_parse_context_overflow() {
        let text = "prompt is too long: 250123 tokens > 200000 maximum";
        assert_eq!(parse_context_overflow(text), Some((250_123, 200_000)));
        assert_eq!(parse_context_overflow("no numbers here"), None);
    }
}
