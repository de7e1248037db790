// src/llm/types.rs
// Wire types shared across the provider boundary

use crate::config::OutputControl;
use crate::db::types::{Role, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One part of a request message's content. Text is the common case;
/// image/file parts carry base64 payloads for models that accept them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { media_type: String, data: String },
    File { media_type: String, data: String, name: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ContentPart::Text { .. })
    }

    /// Rough size of the part for token estimation. Binary parts count
    /// their base64 length; providers bill them differently but this keeps
    /// truncation decisions conservative.
    pub fn estimated_chars(&self) -> usize {
        match self {
            ContentPart::Text { text } => text.len(),
            ContentPart::Image { data, .. } => data.len(),
            ContentPart::File { data, .. } => data.len(),
        }
    }
}

/// A message in an assembled LLM request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl RequestMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::text(text)],
        }
    }

    /// Concatenated text parts (binary parts are skipped).
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn estimated_chars(&self) -> usize {
        self.content.iter().map(|p| p.estimated_chars()).sum()
    }
}

/// A full chat request handed to the provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<RequestMessage>,
    pub output_control: Option<OutputControl>,
}

/// Events produced by a streaming chat call.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmStreamEvent {
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
    Done {
        usage: Option<TokenUsage>,
    },
    Error {
        message: String,
    },
}

/// A document handed to the optional LLM reranker.
#[derive(Debug, Clone, Serialize)]
pub struct RerankDocument {
    pub index: usize,
    pub text: String,
}

/// Per-document score returned by the reranker.
#[derive(Debug, Clone, Deserialize)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}
