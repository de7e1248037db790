// src/resources/summary.rs
// Resource summary notes: Resource-<8hex>.md documents, lazily generated

use crate::db::types::ResourceKind;
use crate::error::{Result, VellumError};
use crate::ids::resource_id;
use crate::llm::prompts::DOC_SUMMARY_PROMPT;
use crate::llm::{ChatRequest, LlmProvider, RequestMessage};
use crate::notes::write_atomic;
use crate::resources::loader::ResourceLoader;
use crate::utils::{now_ms, truncate_chars};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Parsed form of one resource summary note.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceSummary {
    pub id: String,
    pub source: String,
    pub kind: ResourceKind,
    pub title: Option<String>,
    pub short_summary: Option<String>,
    pub full_summary: Option<String>,
    pub last_updated_ts: i64,
    pub conversations: Vec<String>,
    pub projects: Vec<String>,
    pub files: Vec<String>,
}

/// Where a resource is referenced from.
#[derive(Debug, Clone, PartialEq)]
pub enum Mention {
    Conversation(String),
    Project(String),
    File(String),
}

impl ResourceSummary {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            id: resource_id(&source),
            kind: ResourceKind::infer(&source),
            source,
            ..Default::default()
        }
    }

    /// Record a mention, deduplicating.
    pub fn add_mention(&mut self, mention: &Mention) -> bool {
        let list = match mention {
            Mention::Conversation(_) => &mut self.conversations,
            Mention::Project(_) => &mut self.projects,
            Mention::File(_) => &mut self.files,
        };
        let value = match mention {
            Mention::Conversation(v) | Mention::Project(v) | Mention::File(v) => v,
        };
        if list.iter().any(|m| m == value) {
            return false;
        }
        list.push(value.clone());
        true
    }
}

/// Reference link line; the form depends on the resource kind.
fn reference_link(summary: &ResourceSummary) -> String {
    let label = summary
        .title
        .clone()
        .unwrap_or_else(|| summary.source.rsplit('/').next().unwrap_or(&summary.source).to_string());
    match summary.kind {
        ResourceKind::Url => format!("[{}]({})", label, summary.source),
        ResourceKind::Tag => summary.source.clone(),
        ResourceKind::Folder => format!("[[{}/]]", summary.source.trim_end_matches('/')),
        _ => format!("[[{}]]", summary.source),
    }
}

/// Render a resource summary note.
pub fn render_resource_note(summary: &ResourceSummary) -> String {
    let mut out = String::new();
    out.push_str(&reference_link(summary));
    out.push_str("\n\n```meta\n");
    out.push_str(&format!("id: {}\n", summary.id));
    out.push_str(&format!("kind: {}\n", summary.kind));
    out.push_str(&format!("source: {}\n", summary.source));
    if let Some(title) = &summary.title {
        out.push_str(&format!("title: {}\n", title));
    }
    out.push_str(&format!("updated: {}\n", summary.last_updated_ts));
    out.push_str("```\n");

    if let Some(short) = &summary.short_summary {
        out.push_str("\n## Summary\n\n");
        out.push_str(short.trim());
        out.push('\n');
    }
    if let Some(full) = &summary.full_summary {
        out.push_str("\n## Details\n\n");
        out.push_str(full.trim());
        out.push('\n');
    }

    out.push_str("\n## Referenced In\n");
    for (heading, list) in [
        ("Conversations", &summary.conversations),
        ("Projects", &summary.projects),
        ("Files", &summary.files),
    ] {
        if list.is_empty() {
            continue;
        }
        out.push_str(&format!("\n### {}\n", heading));
        for item in list {
            out.push_str(&format!("- {}\n", item));
        }
    }
    out
}

/// Parse a resource summary note back into its meta. Tolerant of missing
/// sections; a note without a meta block is rejected.
pub fn parse_resource_note(text: &str) -> Result<ResourceSummary> {
    let mut summary = ResourceSummary::default();
    let mut in_meta = false;
    let mut section: Option<&str> = None;
    let mut ref_list: Option<&str> = None;
    let mut short_lines: Vec<&str> = Vec::new();
    let mut full_lines: Vec<&str> = Vec::new();
    let mut saw_meta = false;

    for line in text.lines() {
        if line.trim() == "```meta" {
            in_meta = true;
            saw_meta = true;
            continue;
        }
        if in_meta {
            if line.trim() == "```" {
                in_meta = false;
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim();
                match key.trim() {
                    "id" => summary.id = value.to_string(),
                    "kind" => summary.kind = ResourceKind::parse(value),
                    "source" => summary.source = value.to_string(),
                    "title" => summary.title = Some(value.to_string()),
                    "updated" => summary.last_updated_ts = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
            continue;
        }

        if let Some(heading) = line.strip_prefix("## ") {
            section = Some(heading.trim());
            ref_list = None;
            continue;
        }
        if let Some(heading) = line.strip_prefix("### ") {
            ref_list = Some(heading.trim());
            continue;
        }

        match (section, ref_list) {
            (Some("Summary"), _) => short_lines.push(line),
            (Some("Details"), _) => full_lines.push(line),
            (Some("Referenced In"), Some(list)) => {
                if let Some(item) = line.strip_prefix("- ") {
                    let item = item.trim().to_string();
                    match list {
                        "Conversations" => summary.conversations.push(item),
                        "Projects" => summary.projects.push(item),
                        "Files" => summary.files.push(item),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    if !saw_meta || summary.id.is_empty() {
        return Err(VellumError::InvalidInput(
            "not a resource summary note (missing meta block)".into(),
        ));
    }

    let short = short_lines.join("\n").trim().to_string();
    if !short.is_empty() {
        summary.short_summary = Some(short);
    }
    let full = full_lines.join("\n").trim().to_string();
    if !full.is_empty() {
        summary.full_summary = Some(full);
    }
    Ok(summary)
}

/// Disk store for resource summary notes.
pub struct ResourceStore {
    dir: PathBuf,
}

impl ResourceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn note_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("Resource-{}.md", id))
    }

    /// Write (or overwrite) a summary note.
    pub fn save(&self, summary: &ResourceSummary) -> Result<()> {
        write_atomic(&self.note_path(&summary.id), &render_resource_note(summary))
    }

    /// Read one summary note; absent files return None.
    pub fn read(&self, id: &str) -> Result<Option<ResourceSummary>> {
        let path = self.note_path(id);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse_resource_note(&text).map(Some)
    }

    /// Enumerate every summary note in the folder. Malformed notes are
    /// skipped with a warning, in case the user edited one by hand.
    pub fn list(&self) -> Result<Vec<ResourceSummary>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("Resource-") || !name.ends_with(".md") {
                continue;
            }
            match std::fs::read_to_string(entry.path()) {
                Ok(text) => match parse_resource_note(&text) {
                    Ok(summary) => out.push(summary),
                    Err(e) => warn!("Skipping malformed resource note {}: {}", name, e),
                },
                Err(e) => warn!("Failed to read resource note {}: {}", name, e),
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

/// Make sure a resource has a summary note, generating one lazily when
/// missing. The mention is recorded either way. On generation failure the
/// note is still written, with the failure reason and timestamp as its
/// summary, so the resource is never silently dropped.
pub async fn ensure_resource_summary(
    store: &ResourceStore,
    loader: &dyn ResourceLoader,
    provider: &dyn LlmProvider,
    model: (&str, &str),
    source: &str,
    mention: Mention,
) -> Result<ResourceSummary> {
    let id = resource_id(source);

    if let Some(mut existing) = store.read(&id)? {
        if existing.add_mention(&mention) {
            store.save(&existing)?;
        }
        return Ok(existing);
    }

    let mut summary = ResourceSummary::new(source);
    summary.add_mention(&mention);
    summary.last_updated_ts = now_ms();

    match generate_summary(loader, provider, model, &summary).await {
        Ok((short, full)) => {
            summary.short_summary = Some(short);
            summary.full_summary = full;
        }
        Err(e) => {
            warn!("Resource summary generation failed for {}: {}", source, e);
            summary.short_summary = Some(format!(
                "Summary unavailable ({}; at {})",
                e,
                summary.last_updated_ts
            ));
        }
    }

    store.save(&summary)?;
    Ok(summary)
}

async fn generate_summary(
    loader: &dyn ResourceLoader,
    provider: &dyn LlmProvider,
    (provider_name, model): (&str, &str),
    summary: &ResourceSummary,
) -> Result<(String, Option<String>)> {
    let text = loader.fetch_text(&summary.source, summary.kind).await?;
    debug!("Summarizing resource {} ({} chars)", summary.source, text.len());

    let request = ChatRequest {
        provider: provider_name.into(),
        model: model.into(),
        messages: vec![
            RequestMessage::system(DOC_SUMMARY_PROMPT),
            RequestMessage::user(truncate_chars(&text, 12_000)),
        ],
        output_control: None,
    };
    let response = provider
        .complete(request)
        .await
        .map_err(|e| VellumError::ResourceSummaryFailed(e.to_string()))?;

    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err(VellumError::ResourceSummaryFailed("empty summary".into()));
    }

    // First paragraph is the short summary; the remainder (bullets) is the
    // full summary when present.
    let mut parts = trimmed.splitn(2, "\n\n");
    let short = parts.next().unwrap_or(trimmed).trim().to_string();
    let full = parts
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Ok((short, full))
}
