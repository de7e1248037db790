// src/notes.rs
// Conversation note files: the canonical rendered form of message bodies
//
// One markdown file per conversation. Frontmatter carries the metadata a
// human (or the host editor) cares about; each message renders as a
// section whose heading encodes role, timestamp, and message id. The
// database stores only content hashes, so parsing these sections back is
// the sole way to recover bodies.

use crate::db::types::{ChatConversation, ChatMessage, Role};
use crate::error::Result;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::path::Path;

/// Render a full conversation note: frontmatter plus one section per
/// message.
pub fn render_conversation_note(conv: &ChatConversation, messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("id: {}\n", conv.id));
    out.push_str(&format!("title: {}\n", conv.title.replace('\n', " ")));
    if let Some(project_id) = &conv.project_id {
        out.push_str(&format!("project: {}\n", project_id));
    }
    out.push_str(&format!("created: {}\n", conv.created_at));
    out.push_str(&format!("updated: {}\n", conv.updated_at));
    if let Some(model) = &conv.active_model {
        out.push_str(&format!("model: {}\n", model));
    }
    out.push_str("---\n");

    for msg in messages {
        out.push('\n');
        out.push_str(&message_heading(msg.role(), msg.row.created_at, msg.id()));
        out.push('\n');
        out.push('\n');
        if !msg.resources.is_empty() {
            let refs: Vec<String> = msg
                .resources
                .iter()
                .map(|r| format!("[{}](Resource-{})", r.label(), r.id))
                .collect();
            out.push_str(&format!("> attachments: {}\n\n", refs.join(", ")));
        }
        out.push_str(msg.content.trim_end());
        out.push('\n');
    }
    out
}

fn message_heading(role: Role, created_at: i64, id: &str) -> String {
    let when = Utc
        .timestamp_millis_opt(created_at)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| created_at.to_string());
    format!("## {} | {} | msg:{}", role, when, id)
}

/// True for lines that open a message section.
fn is_message_heading(line: &str) -> bool {
    line.starts_with("## ") && line.contains("| msg:")
}

/// Extract the message id from a section heading.
fn heading_message_id(line: &str) -> Option<String> {
    let idx = line.rfind("msg:")?;
    let id = line[idx + 4..].trim();
    if id.is_empty() { None } else { Some(id.to_string()) }
}

/// Parse message bodies out of a rendered note, keyed by message id.
/// Attachment quote lines are dropped (they are re-rendered from the
/// database on the next write).
pub fn parse_note_bodies(text: &str) -> HashMap<String, String> {
    let mut bodies: HashMap<String, String> = HashMap::new();
    let mut current_id: Option<String> = None;
    let mut current_body: Vec<&str> = Vec::new();

    let mut flush = |id: &mut Option<String>, body: &mut Vec<&str>, bodies: &mut HashMap<String, String>| {
        if let Some(id) = id.take() {
            let text = body.join("\n").trim().to_string();
            bodies.insert(id, text);
        }
        body.clear();
    };

    for line in text.lines() {
        if is_message_heading(line) {
            flush(&mut current_id, &mut current_body, &mut bodies);
            current_id = heading_message_id(line);
            continue;
        }
        if current_id.is_some() {
            if line.starts_with("> attachments:") {
                continue;
            }
            current_body.push(line);
        }
    }
    flush(&mut current_id, &mut current_body, &mut bodies);
    bodies
}

/// Parse simple `key: value` frontmatter. Returns an empty map when the
/// document has no frontmatter fence.
pub fn parse_frontmatter(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut lines = text.lines();
    if lines.next() != Some("---") {
        return map;
    }
    for line in lines {
        if line == "---" {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// Write a file atomically: temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp~");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::{MessageRow, ResourceRef};

    fn conversation() -> ChatConversation {
        ChatConversation {
            id: "conv1".into(),
            title: "Planning the garden".into(),
            project_id: Some("proj1".into()),
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_100_000,
            active_model: Some("gpt-4o-mini".into()),
            active_provider: Some("openai".into()),
            token_usage_total: 0,
            title_manually_edited: false,
            title_auto_updated: false,
            attachment_handling: None,
            output_control: None,
            context_last_updated_ts: None,
            context_last_message_index: 0,
            file_rel_path: "Planning-the-garden.md".into(),
            context: None,
            archived: false,
        }
    }

    fn message(id: &str, role: Role, created_at: i64, content: &str) -> ChatMessage {
        ChatMessage {
            row: MessageRow {
                id: id.into(),
                conversation_id: "conv1".into(),
                role,
                content_hash: crate::ids::content_hash(content),
                created_at,
                timezone: "UTC".into(),
                model: None,
                provider: None,
                starred: false,
                is_error: false,
                is_visible: true,
                gen_time_ms: None,
                token_usage: None,
                reasoning: None,
                tool_calls: Vec::new(),
            },
            content: content.into(),
            resources: Vec::new(),
        }
    }

    #[test]
    fn test_render_and_parse_round_trip() {
        let conv = conversation();
        let messages = vec![
            message("m1", Role::User, 1_700_000_000_000, "What should I plant?"),
            message(
                "m2",
                Role::Assistant,
                1_700_000_050_000,
                "Tomatoes do well.\n\nAlso consider basil.",
            ),
        ];
        let note = render_conversation_note(&conv, &messages);

        let bodies = parse_note_bodies(&note);
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies["m1"], "What should I plant?");
        assert_eq!(bodies["m2"], "Tomatoes do well.\n\nAlso consider basil.");

        let front = parse_frontmatter(&note);
        assert_eq!(front["id"], "conv1");
        assert_eq!(front["title"], "Planning the garden");
        assert_eq!(front["project"], "proj1");
    }

    #[test]
    fn test_message_with_attachments_renders_refs() {
        let conv = conversation();
        let mut msg = message("m1", Role::User, 1_700_000_000_000, "See attached");
        msg.resources.push(ResourceRef::new("img/garden.png"));
        let note = render_conversation_note(&conv, &[msg]);

        assert!(note.contains("> attachments: [garden.png](Resource-"));
        // Attachment lines do not leak into the parsed body
        let bodies = parse_note_bodies(&note);
        assert_eq!(bodies["m1"], "See attached");
    }

    #[test]
    fn test_body_with_headings_survives() {
        let conv = conversation();
        let content = "## Not a message heading\n\nsome text";
        let messages = vec![message("m1", Role::User, 0, content)];
        let note = render_conversation_note(&conv, &messages);
        let bodies = parse_note_bodies(&note);
        assert_eq!(bodies["m1"], content);
    }

    #[test]
    fn test_parse_frontmatter_absent() {
        assert!(parse_frontmatter("no frontmatter here").is_empty());
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/note.md");
        write_atomic(&path, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        // Overwrite replaces content
        write_atomic(&path, "world").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "world");
        assert!(!path.with_extension("tmp~").exists());
    }

    #[test]
    fn test_heading_message_id() {
        assert_eq!(
            heading_message_id("## user | 2026-01-01T00:00:00Z | msg:abc123"),
            Some("abc123".into())
        );
        assert_eq!(heading_message_id("## user | time |"), None);
    }
}
