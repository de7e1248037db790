// src/chat/stream.rs
// Stream dispatcher: drives the LLM and fans out typed chat events
//
// Assembler progress events are always forwarded before any LLM event.
// Cancellation is cooperative: the token interrupts assembly or the LLM
// stream at the next await, and whatever text accumulated so far is
// surfaced in the terminal Done event (the conversation service decides
// whether to persist it).

use crate::chat::assembler::{AssemblerEvent, BuildProgress};
use crate::config::OutputControl;
use crate::db::types::TokenUsage;
use crate::llm::{ChatRequest, LlmProvider, LlmStreamEvent, RequestMessage};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Events yielded to the chat consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    Progress(BuildProgress),
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall {
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_name: String,
        input: Value,
        output: Value,
    },
    /// Terminal success (or clean cancellation) with the accumulated turn.
    Done(ChatOutcome),
    /// Terminal failure; no partial message should be persisted.
    Error {
        message: String,
    },
}

/// The accumulated result of one streamed turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOutcome {
    pub content: String,
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
    pub gen_time_ms: u64,
    pub cancelled: bool,
}

/// Model routing for one turn.
#[derive(Debug, Clone)]
pub struct TurnTarget {
    pub provider_name: String,
    pub model: String,
    pub output_control: Option<OutputControl>,
}

/// Drive the assembler and then the LLM, yielding one merged event stream.
pub fn dispatch<S>(
    provider: Arc<dyn LlmProvider>,
    assembler: S,
    target: TurnTarget,
    cancel: CancellationToken,
) -> impl Stream<Item = ChatStreamEvent>
where
    S: Stream<Item = AssemblerEvent> + Send + 'static,
{
    async_stream::stream! {
        let started = Instant::now();
        let mut outcome = ChatOutcome::default();

        // Phase 1: assembly. Forward progress, capture the final prompt.
        // Cancellation and stream items are disambiguated outside the
        // select so yields never sit inside its arms.
        enum Step<T> {
            Cancelled,
            Item(Option<T>),
        }

        let mut prompt: Option<Vec<RequestMessage>> = None;
        futures::pin_mut!(assembler);
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                event = assembler.next() => Step::Item(event),
            };
            match step {
                Step::Cancelled => {
                    outcome.cancelled = true;
                    outcome.gen_time_ms = started.elapsed().as_millis() as u64;
                    yield ChatStreamEvent::Done(outcome);
                    return;
                }
                Step::Item(Some(AssemblerEvent::Progress(p))) => {
                    yield ChatStreamEvent::Progress(p);
                }
                Step::Item(Some(AssemblerEvent::Final(messages))) => {
                    prompt = Some(messages);
                }
                Step::Item(None) => break,
            }
        }
        let Some(messages) = prompt else {
            yield ChatStreamEvent::Error {
                message: "assembler produced no prompt".into(),
            };
            return;
        };

        // Phase 2: the LLM call.
        let request = ChatRequest {
            provider: target.provider_name.clone(),
            model: target.model.clone(),
            messages,
            output_control: target.output_control.clone(),
        };
        let mut llm_stream = match provider.stream_chat(request).await {
            Ok(stream) => stream,
            Err(e) => {
                yield ChatStreamEvent::Error { message: e.to_string() };
                return;
            }
        };

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                event = llm_stream.next() => Step::Item(event),
            };
            let event = match step {
                Step::Cancelled => {
                    outcome.cancelled = true;
                    break;
                }
                Step::Item(event) => event,
            };
            match event {
                Some(LlmStreamEvent::TextDelta(delta)) => {
                    outcome.content.push_str(&delta);
                    yield ChatStreamEvent::TextDelta(delta);
                }
                Some(LlmStreamEvent::ReasoningDelta(delta)) => {
                    outcome
                        .reasoning
                        .get_or_insert_with(String::new)
                        .push_str(&delta);
                    yield ChatStreamEvent::ReasoningDelta(delta);
                }
                Some(LlmStreamEvent::ToolCall { tool_name, input }) => {
                    yield ChatStreamEvent::ToolCall { tool_name, input };
                }
                Some(LlmStreamEvent::ToolResult { tool_name, input, output }) => {
                    yield ChatStreamEvent::ToolResult { tool_name, input, output };
                }
                Some(LlmStreamEvent::Done { usage }) => {
                    outcome.usage = usage;
                    break;
                }
                Some(LlmStreamEvent::Error { message }) => {
                    yield ChatStreamEvent::Error { message };
                    return;
                }
                None => break,
            }
        }

        outcome.gen_time_ms = started.elapsed().as_millis() as u64;
        yield ChatStreamEvent::Done(outcome);
    }
}
