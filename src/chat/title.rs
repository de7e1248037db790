// src/chat/title.rs
// Conversation title generation

use crate::db::types::ChatMessage;
use crate::error::Result;
use crate::llm::prompts::TITLE_PROMPT;
use crate::llm::{ChatRequest, LlmProvider, RequestMessage};
use crate::utils::truncate_chars;

pub const MAX_TITLE_CHARS: usize = 50;
const TITLE_SAMPLE_MESSAGES: usize = 5;
const SAMPLE_CHARS_PER_MESSAGE: usize = 500;

/// Generate a title from the first few messages plus the short summary when
/// one exists. The result is cleaned (quotes stripped, whitespace collapsed)
/// and capped at 50 characters.
pub async fn generate_title(
    provider: &dyn LlmProvider,
    (provider_name, model): (&str, &str),
    messages: &[ChatMessage],
    short_summary: Option<&str>,
) -> Result<String> {
    let mut sample = String::new();
    if let Some(summary) = short_summary {
        sample.push_str(&format!("Summary: {}\n\n", summary));
    }
    for msg in messages.iter().take(TITLE_SAMPLE_MESSAGES) {
        sample.push_str(&format!(
            "{}: {}\n",
            msg.role(),
            truncate_chars(&msg.content, SAMPLE_CHARS_PER_MESSAGE)
        ));
    }

    let raw = provider
        .complete(ChatRequest {
            provider: provider_name.into(),
            model: model.into(),
            messages: vec![
                RequestMessage::system(TITLE_PROMPT),
                RequestMessage::user(sample),
            ],
            output_control: None,
        })
        .await?;

    Ok(clean_title(&raw))
}

/// Strip surrounding quotes and stray whitespace, collapse newlines, cap
/// length.
pub fn clean_title(raw: &str) -> String {
    let collapsed = crate::utils::normalize_whitespace(raw);
    let trimmed = collapsed
        .trim_matches(|c| matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}' | '\u{2018}' | '\u{2019}'))
        .trim();
    truncate_chars(trimmed, MAX_TITLE_CHARS)
}
