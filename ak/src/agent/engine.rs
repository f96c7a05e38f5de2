//! AgentEngine - drives one task through the reason/act cycle
//!
//! One engine instance per embedded task. Tool calls execute strictly
//! sequentially in the order the model emitted them; the loop never requests
//! a new completion while a tool call is unresolved.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{CancelToken, FailureKind, TaskFailure, TranscriptMessage};
use crate::knowledge::KnowledgeStore;
use crate::llm::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, Provider, ProviderError, ProviderEvent, StopReason,
    TokenUsage,
};
use crate::session::SessionRegistry;
use crate::tools::{ToolContext, ToolExecutor};

/// How many times the same failing tool call may repeat before the loop
/// terminates with `tool-loop-detected`
const TOOL_LOOP_LIMIT: u32 = 3;

/// Maximum completion attempts per turn (rate limits and transient faults)
const MAX_RETRIES: u32 = 5;

/// Tunables for one engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_turns: u32,
    /// Approximate character budget for the assembled conversation
    pub char_budget: usize,
    pub max_tokens: u32,
    /// Whether completions stream text into the session buffer
    pub streaming: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            char_budget: 400_000,
            max_tokens: 16384,
            streaming: true,
        }
    }
}

/// Terminal result of one loop run
#[derive(Debug)]
pub enum LoopOutcome {
    /// Clean termination; carries the transcript of assistant text
    Completed { transcript: Vec<TranscriptMessage> },
    /// Cooperative cancellation observed
    Cancelled,
    /// Unrecoverable failure with a machine-readable kind
    Failed(TaskFailure),
}

/// Drives the reason/act cycle for one embedded task
pub struct AgentEngine {
    task_id: String,
    provider: Arc<dyn Provider>,
    executor: Arc<ToolExecutor>,
    sessions: SessionRegistry,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    config: EngineConfig,
    cancel: CancelToken,
    worktree: PathBuf,
}

impl AgentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        provider: Arc<dyn Provider>,
        executor: Arc<ToolExecutor>,
        sessions: SessionRegistry,
        knowledge: Option<Arc<dyn KnowledgeStore>>,
        config: EngineConfig,
        cancel: CancelToken,
        worktree: PathBuf,
    ) -> Self {
        Self {
            task_id,
            provider,
            executor,
            sessions,
            knowledge,
            config,
            cancel,
            worktree,
        }
    }

    /// Run the loop to a terminal outcome
    pub async fn run(&self, prompt: &str) -> LoopOutcome {
        info!(task_id = %self.task_id, "Agent loop starting");

        let system_prompt = self.build_system_prompt(prompt).await;
        let tool_defs = self.executor.definitions();
        let tool_ctx = ToolContext::new(self.worktree.clone(), self.task_id.clone(), self.task_id.clone());

        let mut messages = vec![Message::user(prompt)];
        let mut transcript = vec![TranscriptMessage::user(prompt)];
        // (tool name + arguments) -> consecutive failure count
        let mut failing_calls: HashMap<String, u32> = HashMap::new();
        let mut usage = TokenUsage::default();
        let mut turn = 0u32;

        loop {
            turn += 1;
            if turn > self.config.max_turns {
                warn!(task_id = %self.task_id, max_turns = self.config.max_turns, "Turn limit reached");
                return LoopOutcome::Failed(TaskFailure::new(
                    FailureKind::RunnerError,
                    format!("turn limit ({}) reached", self.config.max_turns),
                ));
            }

            // Cancellation is polled between completions and tool calls
            if self.cancel.is_cancelled() {
                return LoopOutcome::Cancelled;
            }

            trim_to_budget(&mut messages, self.config.char_budget);

            let request = CompletionRequest {
                system_prompt: system_prompt.clone(),
                messages: messages.clone(),
                tools: tool_defs.clone(),
                max_tokens: self.config.max_tokens,
            };

            let response = match self.complete_with_retry(request).await {
                Ok(response) => response,
                Err(CompletionAttempt::Cancelled) => return LoopOutcome::Cancelled,
                Err(CompletionAttempt::Fatal(e)) => {
                    warn!(task_id = %self.task_id, error = %e, "Provider failure is terminal");
                    return LoopOutcome::Failed(TaskFailure::new(e.failure_kind(), e.to_string()));
                }
            };

            usage.accumulate(response.usage);

            if let Some(text) = &response.content
                && !text.is_empty()
            {
                transcript.push(TranscriptMessage::assistant(text.clone()));
                // Non-streaming completions still reach subscribers
                if !self.config.streaming {
                    let _ = self
                        .sessions
                        .append_output(&self.task_id, Bytes::from(text.clone()))
                        .await;
                }
            }

            messages.push(build_assistant_message(&response));

            match response.stop_reason {
                StopReason::EndTurn | StopReason::StopSequence => {
                    info!(
                        task_id = %self.task_id,
                        turns = turn,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "Agent loop complete"
                    );
                    return LoopOutcome::Completed { transcript };
                }
                StopReason::ToolUse => {
                    // Strictly sequential, in emission order
                    let mut result_blocks = Vec::with_capacity(response.tool_calls.len());
                    for call in &response.tool_calls {
                        if self.cancel.is_cancelled() {
                            return LoopOutcome::Cancelled;
                        }

                        let result = self.executor.execute(call, &tool_ctx).await;

                        let key = format!("{}:{}", call.name, call.input);
                        if result.is_error {
                            let count = failing_calls.entry(key).or_insert(0);
                            *count += 1;
                            if *count > TOOL_LOOP_LIMIT {
                                warn!(task_id = %self.task_id, tool = %call.name, "Repeated failing tool call");
                                return LoopOutcome::Failed(TaskFailure::new(
                                    FailureKind::ToolLoopDetected,
                                    format!("tool '{}' failed identically {} times", call.name, count),
                                ));
                            }
                        } else {
                            failing_calls.remove(&key);
                        }

                        result_blocks.push(ContentBlock::tool_result(&call.id, &result.content, result.is_error));
                    }
                    messages.push(Message::user_blocks(result_blocks));
                }
                StopReason::MaxTokens => {
                    messages.push(Message::user(
                        "Continue from where you left off. Your previous response was truncated.",
                    ));
                }
            }
        }
    }

    /// One completion with rate-limit and transient-fault retry
    async fn complete_with_retry(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionAttempt> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = if self.config.streaming {
                self.stream_into_session(request.clone()).await
            } else {
                tokio::select! {
                    result = self.provider.complete(request.clone()) => result,
                    _ = self.cancel.cancelled() => return Err(CompletionAttempt::Cancelled),
                }
            };

            if self.cancel.is_cancelled() {
                return Err(CompletionAttempt::Cancelled);
            }

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_rate_limit() && attempt < MAX_RETRIES => {
                    let delay = e.retry_after().unwrap_or(Duration::from_secs(30));
                    let delay = delay + jitter(delay / 4);
                    warn!(task_id = %self.task_id, ?delay, attempt, "Rate limited, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(CompletionAttempt::Cancelled),
                    }
                }
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = Duration::from_secs(1 << attempt.min(5));
                    let delay = delay + jitter(delay / 2);
                    warn!(task_id = %self.task_id, error = %e, ?delay, attempt, "Transient provider error, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(CompletionAttempt::Cancelled),
                    }
                }
                Err(e) => return Err(CompletionAttempt::Fatal(e)),
            }
        }
    }

    /// Streamed completion forwarding text deltas into the session buffer
    async fn stream_into_session(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let (event_tx, mut event_rx) = mpsc::channel::<ProviderEvent>(64);

        let sessions = self.sessions.clone();
        let task_id = self.task_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let ProviderEvent::TextDelta(text) = event {
                    let _ = sessions.append_output(&task_id, Bytes::from(text)).await;
                }
            }
        });

        let result = tokio::select! {
            result = self.provider.stream(request, event_tx) => result,
            // Dropping the stream future aborts the in-flight request
            _ = self.cancel.cancelled() => Err(ProviderError::Unavailable("cancelled".to_string())),
        };

        let _ = forwarder.await;

        if self.cancel.is_cancelled() {
            // Report cancellation over whatever the stream returned
            return Err(ProviderError::Unavailable("cancelled".to_string()));
        }
        result
    }

    async fn build_system_prompt(&self, task_prompt: &str) -> String {
        let mut prompt = format!(
            "You are an AI agent working on a task. Complete the task using the available tools.\n\
             Working directory: {}",
            self.worktree.display()
        );

        // Knowledge enrichment degrades to nothing on failure
        if let Some(knowledge) = &self.knowledge {
            match knowledge.search(task_prompt, 3, &HashMap::new()).await {
                Ok(results) if !results.is_empty() => {
                    prompt.push_str("\n\nRelevant context:\n");
                    for result in results {
                        prompt.push_str(&format!("- {}\n", result.snippet));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(task_id = %self.task_id, error = %e, "Knowledge search failed, continuing without");
                }
            }
        }

        prompt
    }
}

enum CompletionAttempt {
    Cancelled,
    Fatal(ProviderError),
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(0..max.as_millis().max(1) as u64))
}

/// Drop oldest messages until the conversation fits the character budget
///
/// The system prompt lives outside `messages` and is never trimmed. Tool
/// result messages orphaned by a trim are dropped with their tool_use.
fn trim_to_budget(messages: &mut Vec<Message>, budget: usize) {
    let total = |msgs: &[Message]| msgs.iter().map(|m| m.approx_chars()).sum::<usize>();

    while messages.len() > 1 && total(messages) > budget {
        messages.remove(0);
        // A leading tool_result without its tool_use confuses providers
        if let Some(first) = messages.first()
            && matches!(&first.content, crate::llm::MessageContent::Blocks(blocks)
                if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. })))
        {
            messages.remove(0);
        }
    }
}

fn build_assistant_message(response: &CompletionResponse) -> Message {
    let mut blocks = Vec::new();

    if let Some(text) = &response.content {
        blocks.push(ContentBlock::text(text));
    }
    for call in &response.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }

    Message::assistant_blocks(blocks)
}
