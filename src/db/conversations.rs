// src/db/conversations.rs
// Chat project and conversation rows, including the typed meta-patch builder

use crate::config::{AttachmentHandling, OutputControl};
use crate::db::types::{ChatConversation, ChatProject, ConversationContext, ProjectContext};
use crate::utils::now_ms;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

pub fn create_project_sync(conn: &Connection, project: &ChatProject) -> rusqlite::Result<()> {
    let context_json = project
        .context
        .as_ref()
        .map(|c| serde_json::to_string(c).unwrap_or_default());
    conn.execute(
        "INSERT INTO chat_project (id, name, folder_rel_path, created_at, updated_at, context_json, archived)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            project.id,
            project.name,
            project.folder_rel_path,
            project.created_at,
            project.updated_at,
            context_json,
            project.archived as i64
        ],
    )?;
    Ok(())
}

fn parse_project_row(row: &rusqlite::Row) -> rusqlite::Result<ChatProject> {
    let context_json: Option<String> = row.get(5)?;
    Ok(ChatProject {
        id: row.get(0)?,
        name: row.get(1)?,
        folder_rel_path: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        context: context_json.and_then(|s| serde_json::from_str(&s).ok()),
        archived: row.get::<_, i64>(6)? != 0,
    })
}

const PROJECT_COLS: &str =
    "id, name, folder_rel_path, created_at, updated_at, context_json, archived";

pub fn get_project_sync(conn: &Connection, id: &str) -> rusqlite::Result<Option<ChatProject>> {
    conn.query_row(
        &format!("SELECT {PROJECT_COLS} FROM chat_project WHERE id = ?"),
        params![id],
        parse_project_row,
    )
    .optional()
}

/// Non-archived projects, most recently updated first.
pub fn list_projects_sync(
    conn: &Connection,
    limit: usize,
    offset: usize,
) -> rusqlite::Result<Vec<ChatProject>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROJECT_COLS} FROM chat_project
         WHERE archived = 0
         ORDER BY updated_at DESC
         LIMIT ? OFFSET ?"
    ))?;
    let rows = stmt.query_map(params![limit as i64, offset as i64], parse_project_row)?;
    rows.collect()
}

/// Persist a freshly computed project context.
pub fn update_project_context_sync(
    conn: &Connection,
    id: &str,
    context: &ProjectContext,
) -> rusqlite::Result<bool> {
    let json = serde_json::to_string(context).unwrap_or_default();
    let n = conn.execute(
        "UPDATE chat_project SET context_json = ? WHERE id = ?",
        params![json, id],
    )?;
    Ok(n > 0)
}

/// Move a project to a new folder (archiving) and flag it.
pub fn mark_project_archived_sync(
    conn: &Connection,
    id: &str,
    new_folder_rel_path: &str,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE chat_project SET folder_rel_path = ?, archived = 1 WHERE id = ?",
        params![new_folder_rel_path, id],
    )?;
    Ok(n > 0)
}

pub fn delete_project_row_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM chat_project WHERE id = ?", params![id])? > 0)
}

/// Flag one conversation as archived at its new path.
pub fn archive_conversation_sync(
    conn: &Connection,
    id: &str,
    new_file_rel_path: &str,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE chat_conversation SET file_rel_path = ?, archived = 1 WHERE id = ?",
        params![new_file_rel_path, id],
    )?;
    Ok(n > 0)
}

/// Archive a project and cascade the folder move to its conversations'
/// paths, all in one transaction.
pub fn archive_project_cascade_sync(
    conn: &Connection,
    project_id: &str,
    old_folder: &str,
    new_folder: &str,
) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE chat_project SET folder_rel_path = ?, archived = 1 WHERE id = ?",
        params![new_folder, project_id],
    )?;
    let like = format!("{}/%", old_folder.trim_end_matches('/'));
    tx.execute(
        "UPDATE chat_conversation
         SET file_rel_path = ? || SUBSTR(file_rel_path, ?), archived = 1
         WHERE project_id = ? AND file_rel_path LIKE ?",
        params![
            new_folder,
            old_folder.trim_end_matches('/').len() as i64 + 1,
            project_id,
            like
        ],
    )?;
    tx.commit()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

const CONV_COLS: &str = "id, title, project_id, created_at, updated_at, active_model, \
     active_provider, token_usage_total, title_manually_edited, title_auto_updated, \
     attachment_handling, output_control_json, context_last_updated_ts, \
     context_last_message_index, file_rel_path, context_json, archived";

fn parse_conversation_row(row: &rusqlite::Row) -> rusqlite::Result<ChatConversation> {
    let attachment: Option<String> = row.get(10)?;
    let output_control_json: Option<String> = row.get(11)?;
    let context_json: Option<String> = row.get(15)?;
    Ok(ChatConversation {
        id: row.get(0)?,
        title: row.get(1)?,
        project_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        active_model: row.get(5)?,
        active_provider: row.get(6)?,
        token_usage_total: row.get(7)?,
        title_manually_edited: row.get::<_, i64>(8)? != 0,
        title_auto_updated: row.get::<_, i64>(9)? != 0,
        attachment_handling: attachment.and_then(|s| match s.as_str() {
            "direct" => Some(AttachmentHandling::Direct),
            "degrade_to_text" => Some(AttachmentHandling::DegradeToText),
            _ => None,
        }),
        output_control: output_control_json.and_then(|s| serde_json::from_str(&s).ok()),
        context_last_updated_ts: row.get(12)?,
        context_last_message_index: row.get(13)?,
        file_rel_path: row.get(14)?,
        context: context_json.and_then(|s| serde_json::from_str(&s).ok()),
        archived: row.get::<_, i64>(16)? != 0,
    })
}

pub fn create_conversation_sync(
    conn: &Connection,
    conv: &ChatConversation,
) -> rusqlite::Result<()> {
    let attachment = conv.attachment_handling.map(|a| match a {
        AttachmentHandling::Direct => "direct",
        AttachmentHandling::DegradeToText => "degrade_to_text",
    });
    let output_control = conv
        .output_control
        .as_ref()
        .map(|o| serde_json::to_string(o).unwrap_or_default());
    let context = conv
        .context
        .as_ref()
        .map(|c| serde_json::to_string(c).unwrap_or_default());
    conn.execute(
        "INSERT INTO chat_conversation
         (id, title, project_id, created_at, updated_at, active_model, active_provider,
          token_usage_total, title_manually_edited, title_auto_updated, attachment_handling,
          output_control_json, context_last_updated_ts, context_last_message_index,
          file_rel_path, context_json, archived)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            conv.id,
            conv.title,
            conv.project_id,
            conv.created_at,
            conv.updated_at,
            conv.active_model,
            conv.active_provider,
            conv.token_usage_total,
            conv.title_manually_edited as i64,
            conv.title_auto_updated as i64,
            attachment,
            output_control,
            conv.context_last_updated_ts,
            conv.context_last_message_index,
            conv.file_rel_path,
            context,
            conv.archived as i64
        ],
    )?;
    Ok(())
}

pub fn get_conversation_sync(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<ChatConversation>> {
    conn.query_row(
        &format!("SELECT {CONV_COLS} FROM chat_conversation WHERE id = ?"),
        params![id],
        parse_conversation_row,
    )
    .optional()
}

/// Non-archived conversations ordered by `updated_at` descending. With a
/// project id, only that project's conversations; without one, all of them.
pub fn list_conversations_sync(
    conn: &Connection,
    project_id: Option<&str>,
    limit: usize,
    offset: usize,
) -> rusqlite::Result<Vec<ChatConversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONV_COLS} FROM chat_conversation
         WHERE archived = 0 AND (?1 IS NULL OR project_id = ?1)
         ORDER BY updated_at DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(
        params![project_id, limit as i64, offset as i64],
        parse_conversation_row,
    )?;
    rows.collect()
}

/// Non-archived conversations with no project (archiver eligibility scan),
/// oldest activity first.
pub fn list_root_conversations_sync(
    conn: &Connection,
) -> rusqlite::Result<Vec<ChatConversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONV_COLS} FROM chat_conversation
         WHERE archived = 0 AND project_id IS NULL
         ORDER BY updated_at ASC"
    ))?;
    let rows = stmt.query_map([], parse_conversation_row)?;
    rows.collect()
}

/// Non-archived conversations belonging to a project (project archiving
/// cascades through these).
pub fn list_project_conversations_sync(
    conn: &Connection,
    project_id: &str,
) -> rusqlite::Result<Vec<ChatConversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONV_COLS} FROM chat_conversation
         WHERE archived = 0 AND project_id = ?
         ORDER BY updated_at ASC"
    ))?;
    let rows = stmt.query_map(params![project_id], parse_conversation_row)?;
    rows.collect()
}

// ---------------------------------------------------------------------------
// Meta patches
// ---------------------------------------------------------------------------

/// Typed partial update for conversation metadata. One builder method per
/// column group; applying the patch bumps `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct ConversationMetaPatch {
    title: Option<(String, bool, bool)>,
    model_provider: Option<(String, String)>,
    token_usage_total: Option<i64>,
    attachment_handling: Option<Option<AttachmentHandling>>,
    output_control: Option<Option<OutputControl>>,
    context_pointers: Option<(i64, i64)>,
    file_rel_path: Option<String>,
    archived: Option<bool>,
}

impl ConversationMetaPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.model_provider.is_none()
            && self.token_usage_total.is_none()
            && self.attachment_handling.is_none()
            && self.output_control.is_none()
            && self.context_pointers.is_none()
            && self.file_rel_path.is_none()
            && self.archived.is_none()
    }

    pub fn title(mut self, title: impl Into<String>, manually_edited: bool, auto_updated: bool) -> Self {
        self.title = Some((title.into(), manually_edited, auto_updated));
        self
    }

    pub fn model_provider(mut self, model: impl Into<String>, provider: impl Into<String>) -> Self {
        self.model_provider = Some((model.into(), provider.into()));
        self
    }

    pub fn token_usage_total(mut self, total: i64) -> Self {
        self.token_usage_total = Some(total);
        self
    }

    pub fn attachment_handling(mut self, handling: Option<AttachmentHandling>) -> Self {
        self.attachment_handling = Some(handling);
        self
    }

    pub fn output_control(mut self, control: Option<OutputControl>) -> Self {
        self.output_control = Some(control);
        self
    }

    /// Context bookkeeping columns: last-updated timestamp and the message
    /// index the summary covers.
    pub fn context_pointers(mut self, last_updated_ts: i64, last_message_index: i64) -> Self {
        self.context_pointers = Some((last_updated_ts, last_message_index));
        self
    }

    pub fn file_rel_path(mut self, path: impl Into<String>) -> Self {
        self.file_rel_path = Some(path.into());
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }
}

/// Apply a partial meta update. A missing conversation is a no-op (returns
/// false), not an error.
pub fn upsert_conversation_meta_sync(
    conn: &Connection,
    id: &str,
    patch: &ConversationMetaPatch,
) -> rusqlite::Result<bool> {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some((title, manual, auto)) = &patch.title {
        sets.push("title = ?");
        values.push(Value::Text(title.clone()));
        sets.push("title_manually_edited = ?");
        values.push(Value::Integer(*manual as i64));
        sets.push("title_auto_updated = ?");
        values.push(Value::Integer(*auto as i64));
    }
    if let Some((model, provider)) = &patch.model_provider {
        sets.push("active_model = ?");
        values.push(Value::Text(model.clone()));
        sets.push("active_provider = ?");
        values.push(Value::Text(provider.clone()));
    }
    if let Some(total) = patch.token_usage_total {
        sets.push("token_usage_total = ?");
        values.push(Value::Integer(total));
    }
    if let Some(handling) = &patch.attachment_handling {
        sets.push("attachment_handling = ?");
        values.push(match handling {
            Some(AttachmentHandling::Direct) => Value::Text("direct".into()),
            Some(AttachmentHandling::DegradeToText) => Value::Text("degrade_to_text".into()),
            None => Value::Null,
        });
    }
    if let Some(control) = &patch.output_control {
        sets.push("output_control_json = ?");
        values.push(match control {
            Some(c) => Value::Text(serde_json::to_string(c).unwrap_or_default()),
            None => Value::Null,
        });
    }
    if let Some((ts, index)) = patch.context_pointers {
        sets.push("context_last_updated_ts = ?");
        values.push(Value::Integer(ts));
        sets.push("context_last_message_index = ?");
        values.push(Value::Integer(index));
    }
    if let Some(path) = &patch.file_rel_path {
        sets.push("file_rel_path = ?");
        values.push(Value::Text(path.clone()));
    }
    if let Some(archived) = patch.archived {
        sets.push("archived = ?");
        values.push(Value::Integer(archived as i64));
    }

    if sets.is_empty() {
        return Ok(false);
    }

    sets.push("updated_at = ?");
    values.push(Value::Integer(now_ms()));
    values.push(Value::Text(id.to_string()));

    let sql = format!(
        "UPDATE chat_conversation SET {} WHERE id = ?",
        sets.join(", ")
    );
    let n = conn.execute(&sql, params_from_iter(values))?;
    Ok(n > 0)
}

/// Persist a freshly computed conversation context window, guarded by the
/// `updated_at` value observed when the window was built. Returns false on
/// a version conflict (someone wrote the conversation meanwhile); the
/// caller discards its summary and waits for the next MessageSent.
///
/// Deliberately does NOT bump `updated_at`: background summarization is not
/// user activity and must not reorder the conversation list.
pub fn update_conversation_context_sync(
    conn: &Connection,
    id: &str,
    context: &ConversationContext,
    message_index: i64,
    expected_updated_at: i64,
) -> rusqlite::Result<bool> {
    let json = serde_json::to_string(context).unwrap_or_default();
    let n = conn.execute(
        "UPDATE chat_conversation
         SET context_json = ?, context_last_updated_ts = ?, context_last_message_index = ?
         WHERE id = ? AND updated_at = ?",
        params![json, now_ms(), message_index, id, expected_updated_at],
    )?;
    Ok(n > 0)
}

/// Transactional delete of a conversation's database footprint: message
/// rows, message-resource links, starred projections, and the conversation
/// row itself. Returns the project id and file path for the caller's file
/// cleanup and event, or None when the conversation does not exist.
pub fn delete_conversation_db_sync(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<(Option<String>, String)>> {
    let meta: Option<(Option<String>, String)> = conn
        .query_row(
            "SELECT project_id, file_rel_path FROM chat_conversation WHERE id = ?",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some(meta) = meta else {
        return Ok(None);
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM message_resource WHERE conversation_id = ?",
        params![id],
    )?;
    tx.execute(
        "DELETE FROM starred_message WHERE conversation_id = ?",
        params![id],
    )?;
    tx.execute(
        "DELETE FROM chat_message WHERE conversation_id = ?",
        params![id],
    )?;
    tx.execute("DELETE FROM chat_conversation WHERE id = ?", params![id])?;
    tx.commit()?;

    Ok(Some(meta))
}
