// src/context/window.rs
// Building a conversation's context window (summaries + recent pointers)

use crate::db::types::{ChatMessage, ConversationContext};
use crate::llm::prompts::{CONV_SUMMARY_FULL, CONV_SUMMARY_SHORT, DEFAULT_SUMMARY};
use crate::llm::{ChatRequest, LlmProvider, RequestMessage};
use crate::utils::truncate_chars;
use tracing::warn;

/// Messages kept verbatim as the recent window.
pub const RECENT_WINDOW_SIZE: usize = 10;

/// A full summary is only worth rendering past this length.
const FULL_SUMMARY_MIN_MESSAGES: usize = 5;

const TRANSCRIPT_CHARS_PER_MESSAGE: usize = 1000;

/// Render the transcript handed to the summary prompts.
fn transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            format!(
                "{}: {}",
                m.role().as_str().to_uppercase(),
                truncate_chars(&m.content, TRANSCRIPT_CHARS_PER_MESSAGE)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split the short-summary response into the summary text and the trailing
/// `Topics:` line.
fn parse_short_summary(raw: &str) -> (String, Vec<String>) {
    let mut summary_lines: Vec<&str> = Vec::new();
    let mut topics: Vec<String> = Vec::new();
    for line in raw.trim().lines() {
        if let Some(rest) = line.trim().strip_prefix("Topics:") {
            topics = rest
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        } else {
            summary_lines.push(line);
        }
    }
    (summary_lines.join("\n").trim().to_string(), topics)
}

/// Build a fresh context window for a conversation.
///
/// Empty histories produce the default-summary sentinel and an empty
/// window. LLM failures degrade the same way (sentinel + window pointers),
/// so a flaky provider never wipes an existing summary's replacement.
pub async fn build_context_window(
    provider: &dyn LlmProvider,
    (provider_name, model): (&str, &str),
    messages: &[ChatMessage],
) -> ConversationContext {
    let mut context = ConversationContext {
        short_summary: DEFAULT_SUMMARY.to_string(),
        ..Default::default()
    };
    if messages.is_empty() {
        return context;
    }

    let window_start = messages.len().saturating_sub(RECENT_WINDOW_SIZE);
    let recent = &messages[window_start..];
    context.recent_window_start_id = recent.first().map(|m| m.id().to_string());
    context.recent_window_end_id = recent.last().map(|m| m.id().to_string());

    let mut resource_ids: Vec<String> = Vec::new();
    for msg in messages {
        for resource in &msg.resources {
            if !resource_ids.contains(&resource.id) {
                resource_ids.push(resource.id.clone());
            }
        }
    }
    context.resource_ids = resource_ids;

    let text = transcript(messages);

    let short = provider
        .complete(ChatRequest {
            provider: provider_name.into(),
            model: model.into(),
            messages: vec![
                RequestMessage::system(CONV_SUMMARY_SHORT),
                RequestMessage::user(text.clone()),
            ],
            output_control: None,
        })
        .await;
    match short {
        Ok(raw) => {
            let (summary, topics) = parse_short_summary(&raw);
            if !summary.is_empty() {
                context.short_summary = summary;
            }
            context.topics = topics;
        }
        Err(e) => {
            warn!("Short summary failed, keeping sentinel: {}", e);
            return context;
        }
    }

    if messages.len() > FULL_SUMMARY_MIN_MESSAGES {
        let full = provider
            .complete(ChatRequest {
                provider: provider_name.into(),
                model: model.into(),
                messages: vec![
                    RequestMessage::system(CONV_SUMMARY_FULL),
                    RequestMessage::user(text),
                ],
                output_control: None,
            })
            .await;
        match full {
            Ok(raw) => {
                let trimmed = raw.trim().to_string();
                if !trimmed.is_empty() {
                    context.full_summary = Some(trimmed);
                }
            }
            Err(e) => warn!("Full summary failed, short summary kept: {}", e),
        }
    }

    context
}

/// Whether a stored summary is worth showing or acting on.
pub fn summary_is_meaningful(summary: &str) -> bool {
    !summary.trim().is_empty() && summary != DEFAULT_SUMMARY
}
