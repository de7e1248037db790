// src/db/types.rs
// Row types shared across the store and runtime layers

use crate::config::{AttachmentHandling, OutputControl};
use serde::{Deserialize, Serialize};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an attached or referenced resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Markdown,
    Image,
    Pdf,
    Url,
    Tag,
    Folder,
    Attachment,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Markdown => "markdown",
            ResourceKind::Image => "image",
            ResourceKind::Pdf => "pdf",
            ResourceKind::Url => "url",
            ResourceKind::Tag => "tag",
            ResourceKind::Folder => "folder",
            ResourceKind::Attachment => "attachment",
            ResourceKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "markdown" => ResourceKind::Markdown,
            "image" => ResourceKind::Image,
            "pdf" => ResourceKind::Pdf,
            "url" => ResourceKind::Url,
            "tag" => ResourceKind::Tag,
            "folder" => ResourceKind::Folder,
            "attachment" => ResourceKind::Attachment,
            _ => ResourceKind::Other,
        }
    }

    /// Guess the kind from a source path or URL.
    pub fn infer(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            return ResourceKind::Url;
        }
        if let Some(tag) = source.strip_prefix('#') {
            if !tag.is_empty() {
                return ResourceKind::Tag;
            }
        }
        if source.ends_with('/') {
            return ResourceKind::Folder;
        }
        let ext = source.rsplit('.').next().unwrap_or("").to_lowercase();
        match ext.as_str() {
            "md" | "markdown" => ResourceKind::Markdown,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => ResourceKind::Image,
            "pdf" => ResourceKind::Pdf,
            "txt" | "csv" | "json" | "toml" | "yaml" | "yml" => ResourceKind::Attachment,
            _ => ResourceKind::Other,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ResourceKind {
    fn default() -> Self {
        ResourceKind::Other
    }
}

/// A resource attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    pub source: String,
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ResourceRef {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            id: crate::ids::resource_id(&source),
            kind: ResourceKind::infer(&source),
            title: None,
            source,
        }
    }

    /// Human-readable label for previews: title when present, otherwise the
    /// final path segment of the source.
    pub fn label(&self) -> String {
        if let Some(t) = &self.title {
            return t.clone();
        }
        self.source
            .rsplit('/')
            .next()
            .unwrap_or(&self.source)
            .to_string()
    }
}

/// Corpus document metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DocMeta {
    pub id: String,
    pub path: String,
    pub mtime: i64,
    pub ctime: i64,
    pub content_hash: String,
    pub word_count: i64,
    pub link_count: i64,
    pub tags: Vec<String>,
}

/// One stored embedding (a chunk of a document).
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub id: String,
    pub doc_id: String,
    pub chunk_id: Option<String>,
    pub chunk_index: Option<i64>,
    pub content_hash: String,
    pub ctime: i64,
    pub mtime: i64,
    pub embedding: Vec<f32>,
    pub embedding_model: String,
}

impl EmbeddingRecord {
    pub fn embedding_len(&self) -> usize {
        self.embedding.len()
    }
}

/// Normalized token usage for one LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }
}

/// A tool invocation recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Persisted per-project context (summary + resource index).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub short_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_summary: Option<String>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
    pub last_updated_ts: i64,
}

/// Persisted per-conversation context window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub short_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_summary: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Message ids bounding the recent window kept verbatim in prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_window_start_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_window_end_id: Option<String>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

/// A chat project (folder of conversations).
#[derive(Debug, Clone, PartialEq)]
pub struct ChatProject {
    pub id: String,
    pub name: String,
    pub folder_rel_path: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub context: Option<ProjectContext>,
    pub archived: bool,
}

/// A chat conversation's metadata row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConversation {
    pub id: String,
    pub title: String,
    pub project_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub active_model: Option<String>,
    pub active_provider: Option<String>,
    pub token_usage_total: i64,
    pub title_manually_edited: bool,
    pub title_auto_updated: bool,
    pub attachment_handling: Option<AttachmentHandling>,
    pub output_control: Option<OutputControl>,
    pub context_last_updated_ts: Option<i64>,
    pub context_last_message_index: i64,
    pub file_rel_path: String,
    pub context: Option<ConversationContext>,
    pub archived: bool,
}

/// Message metadata as stored in the database (no body text).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content_hash: String,
    pub created_at: i64,
    pub timezone: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub starred: bool,
    pub is_error: bool,
    pub is_visible: bool,
    pub gen_time_ms: Option<i64>,
    pub token_usage: Option<TokenUsage>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// A full message: row metadata joined with the note-file body and the
/// resources attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub row: MessageRow,
    pub content: String,
    pub resources: Vec<ResourceRef>,
}

impl ChatMessage {
    pub fn id(&self) -> &str {
        &self.row.id
    }

    pub fn role(&self) -> Role {
        self.row.role
    }
}

/// Starred-message projection row.
#[derive(Debug, Clone, PartialEq)]
pub struct StarredMessage {
    pub source_message_id: String,
    pub conversation_id: String,
    pub project_id: Option<String>,
    pub active: bool,
    pub content_preview: Option<String>,
    pub attachment_summary: Option<String>,
}

/// Per-document behavioral statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocStats {
    pub open_count: i64,
    pub last_open_ts: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("robot"), None);
    }

    #[test]
    fn test_resource_kind_infer() {
        assert_eq!(ResourceKind::infer("notes/a.md"), ResourceKind::Markdown);
        assert_eq!(ResourceKind::infer("img/shot.PNG"), ResourceKind::Image);
        assert_eq!(ResourceKind::infer("paper.pdf"), ResourceKind::Pdf);
        assert_eq!(ResourceKind::infer("https://example.com"), ResourceKind::Url);
        assert_eq!(ResourceKind::infer("#rust"), ResourceKind::Tag);
        assert_eq!(ResourceKind::infer("notes/daily/"), ResourceKind::Folder);
        assert_eq!(ResourceKind::infer("data.csv"), ResourceKind::Attachment);
        assert_eq!(ResourceKind::infer("binary.xyz"), ResourceKind::Other);
    }

    #[test]
    fn test_resource_ref_label() {
        let mut r = ResourceRef::new("notes/deep/design.md");
        assert_eq!(r.label(), "design.md");
        r.title = Some("Design Doc".into());
        assert_eq!(r.label(), "Design Doc");
    }

    #[test]
    fn test_resource_ref_id_is_deterministic() {
        let a = ResourceRef::new("notes/a.md");
        let b = ResourceRef::new("notes/a.md");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 8);
    }

    #[test]
    fn test_token_usage_new() {
        let u = TokenUsage::new(100, 50);
        assert_eq!(u.total_tokens, 150);
    }
}
