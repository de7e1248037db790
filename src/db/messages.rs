// src/db/messages.rs
// Message rows, attached-resource links, starred-message projection

use crate::db::types::{MessageRow, ResourceKind, ResourceRef, Role, StarredMessage};
use rusqlite::{Connection, OptionalExtension, params};

const MSG_COLS: &str = "id, conversation_id, role, content_hash, created_at, timezone, model, \
     provider, starred, is_error, is_visible, gen_time_ms, token_usage_json, reasoning, \
     tool_calls_json";

fn parse_message_row(row: &rusqlite::Row) -> rusqlite::Result<MessageRow> {
    let role_str: String = row.get(2)?;
    let token_usage_json: Option<String> = row.get(12)?;
    let tool_calls_json: Option<String> = row.get(14)?;
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: Role::parse(&role_str).unwrap_or(Role::User),
        content_hash: row.get(3)?,
        created_at: row.get(4)?,
        timezone: row.get(5)?,
        model: row.get(6)?,
        provider: row.get(7)?,
        starred: row.get::<_, i64>(8)? != 0,
        is_error: row.get::<_, i64>(9)? != 0,
        is_visible: row.get::<_, i64>(10)? != 0,
        gen_time_ms: row.get(11)?,
        token_usage: token_usage_json.and_then(|s| serde_json::from_str(&s).ok()),
        reasoning: row.get(13)?,
        tool_calls: tool_calls_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    })
}

/// Append a message row and its resource links.
pub fn insert_message_sync(
    conn: &Connection,
    row: &MessageRow,
    resources: &[ResourceRef],
) -> rusqlite::Result<()> {
    let token_usage = row
        .token_usage
        .as_ref()
        .map(|u| serde_json::to_string(u).unwrap_or_default());
    let tool_calls = if row.tool_calls.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&row.tool_calls).unwrap_or_default())
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO chat_message
         (id, conversation_id, role, content_hash, created_at, timezone, model, provider,
          starred, is_error, is_visible, gen_time_ms, token_usage_json, reasoning, tool_calls_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            row.id,
            row.conversation_id,
            row.role.as_str(),
            row.content_hash,
            row.created_at,
            row.timezone,
            row.model,
            row.provider,
            row.starred as i64,
            row.is_error as i64,
            row.is_visible as i64,
            row.gen_time_ms,
            token_usage,
            row.reasoning,
            tool_calls
        ],
    )?;
    {
        let mut ins = tx.prepare(
            "INSERT OR IGNORE INTO message_resource
             (message_id, conversation_id, resource_id, source, kind, title)
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;
        for r in resources {
            ins.execute(params![
                row.id,
                row.conversation_id,
                r.id,
                r.source,
                r.kind.as_str(),
                r.title
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn get_message_row_sync(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<MessageRow>> {
    conn.query_row(
        &format!("SELECT {MSG_COLS} FROM chat_message WHERE id = ?"),
        params![id],
        parse_message_row,
    )
    .optional()
}

/// All message rows of a conversation in chronological order.
pub fn list_message_rows_sync(
    conn: &Connection,
    conversation_id: &str,
) -> rusqlite::Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MSG_COLS} FROM chat_message
         WHERE conversation_id = ?
         ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
    rows.collect()
}

pub fn count_messages_sync(conn: &Connection, conversation_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM chat_message WHERE conversation_id = ?",
        params![conversation_id],
        |row| row.get(0),
    )
}

/// Messages across a project's conversations newer than a timestamp (the
/// project summarizer's threshold input).
pub fn count_project_messages_since_sync(
    conn: &Connection,
    project_id: &str,
    since_ts: i64,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM chat_message m
         JOIN chat_conversation c ON c.id = m.conversation_id
         WHERE c.project_id = ? AND m.created_at > ?",
        params![project_id, since_ts],
        |row| row.get(0),
    )
}

/// Resources attached to one message.
pub fn resources_for_message_sync(
    conn: &Connection,
    message_id: &str,
) -> rusqlite::Result<Vec<ResourceRef>> {
    let mut stmt = conn.prepare(
        "SELECT resource_id, source, kind, title FROM message_resource WHERE message_id = ?",
    )?;
    let rows = stmt.query_map(params![message_id], |row| {
        let kind: String = row.get(2)?;
        Ok(ResourceRef {
            id: row.get(0)?,
            source: row.get(1)?,
            kind: ResourceKind::parse(&kind),
            title: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// Star or unstar a message, keeping the projection row and the preview
/// columns consistent: preview/attachment summary are populated iff
/// starred. Targeting a missing message is a no-op.
pub fn update_message_starred_sync(
    conn: &Connection,
    message_id: &str,
    starred: bool,
    content_preview: Option<&str>,
    attachment_summary: Option<&str>,
    project_id: Option<&str>,
) -> rusqlite::Result<bool> {
    let conversation_id: Option<String> = conn
        .query_row(
            "SELECT conversation_id FROM chat_message WHERE id = ?",
            params![message_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(conversation_id) = conversation_id else {
        return Ok(false);
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE chat_message SET starred = ? WHERE id = ?",
        params![starred as i64, message_id],
    )?;
    if starred {
        tx.execute(
            "INSERT INTO starred_message
             (source_message_id, conversation_id, project_id, active, content_preview, attachment_summary)
             VALUES (?, ?, ?, 1, ?, ?)
             ON CONFLICT(source_message_id) DO UPDATE SET
                active = 1,
                project_id = excluded.project_id,
                content_preview = excluded.content_preview,
                attachment_summary = excluded.attachment_summary",
            params![message_id, conversation_id, project_id, content_preview, attachment_summary],
        )?;
    } else {
        tx.execute(
            "UPDATE starred_message
             SET active = 0, content_preview = NULL, attachment_summary = NULL
             WHERE source_message_id = ?",
            params![message_id],
        )?;
    }
    tx.commit()?;
    Ok(true)
}

fn parse_starred_row(row: &rusqlite::Row) -> rusqlite::Result<StarredMessage> {
    Ok(StarredMessage {
        source_message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        project_id: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
        content_preview: row.get(4)?,
        attachment_summary: row.get(5)?,
    })
}

/// Active starred messages, optionally restricted to one conversation.
pub fn list_starred_sync(
    conn: &Connection,
    conversation_id: Option<&str>,
) -> rusqlite::Result<Vec<StarredMessage>> {
    let mut stmt = conn.prepare(
        "SELECT source_message_id, conversation_id, project_id, active, content_preview, attachment_summary
         FROM starred_message
         WHERE active = 1 AND (?1 IS NULL OR conversation_id = ?1)",
    )?;
    let rows = stmt.query_map(params![conversation_id], parse_starred_row)?;
    rows.collect()
}

pub fn get_starred_sync(
    conn: &Connection,
    message_id: &str,
) -> rusqlite::Result<Option<StarredMessage>> {
    conn.query_row(
        "SELECT source_message_id, conversation_id, project_id, active, content_preview, attachment_summary
         FROM starred_message WHERE source_message_id = ?",
        params![message_id],
        parse_starred_row,
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::conversations::create_conversation_sync;
    use crate::db::schema::run_all_migrations;
    use crate::db::types::{ChatConversation, TokenUsage, ToolCallRecord};

    fn test_conn() -> Connection {
        crate::db::pool::ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        seed_conversation(&conn, "c1");
        conn
    }

    fn seed_conversation(conn: &Connection, id: &str) {
        create_conversation_sync(
            conn,
            &ChatConversation {
                id: id.into(),
                title: "t".into(),
                project_id: None,
                created_at: 0,
                updated_at: 0,
                active_model: None,
                active_provider: None,
                token_usage_total: 0,
                title_manually_edited: false,
                title_auto_updated: false,
                attachment_handling: None,
                output_control: None,
                context_last_updated_ts: None,
                context_last_message_index: 0,
                file_rel_path: format!("{id}.md"),
                context: None,
                archived: false,
            },
        )
        .unwrap();
    }

    fn message(id: &str, role: Role, created_at: i64) -> MessageRow {
        MessageRow {
            id: id.into(),
            conversation_id: "c1".into(),
            role,
            content_hash: "hash".into(),
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
        }
    }

    #[test]
    fn test_insert_and_list_ordered() {
        let conn = test_conn();
        insert_message_sync(&conn, &message("m2", Role::Assistant, 200), &[]).unwrap();
        insert_message_sync(&conn, &message("m1", Role::User, 100), &[]).unwrap();

        let rows = list_message_rows_sync(&conn, "c1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "m1");
        assert_eq!(rows[1].id, "m2");
        assert_eq!(count_messages_sync(&conn, "c1").unwrap(), 2);
    }

    #[test]
    fn test_message_row_json_fields_round_trip() {
        let conn = test_conn();
        let mut row = message("m1", Role::Assistant, 100);
        row.token_usage = Some(TokenUsage::new(120, 80));
        row.reasoning = Some("thought about it".into());
        row.tool_calls = vec![ToolCallRecord {
            tool_name: "vault_search".into(),
            input: serde_json::json!({"query": "rust"}),
            output: Some(serde_json::json!({"hits": 3})),
        }];
        insert_message_sync(&conn, &row, &[]).unwrap();

        let loaded = get_message_row_sync(&conn, "m1").unwrap().unwrap();
        assert_eq!(loaded, row);
    }

    #[test]
    fn test_message_resources_linked() {
        let conn = test_conn();
        let resources = vec![
            ResourceRef::new("notes/design.md"),
            ResourceRef::new("img/shot.png"),
        ];
        insert_message_sync(&conn, &message("m1", Role::User, 100), &resources).unwrap();

        let loaded = resources_for_message_sync(&conn, "m1").unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|r| r.kind == ResourceKind::Image));
    }

    #[test]
    fn test_star_unstar_preview_invariant() {
        let conn = test_conn();
        insert_message_sync(&conn, &message("m1", Role::User, 100), &[]).unwrap();

        // Star with preview
        assert!(update_message_starred_sync(
            &conn,
            "m1",
            true,
            Some("a preview"),
            Some("design.md"),
            None
        )
        .unwrap());
        let starred = get_starred_sync(&conn, "m1").unwrap().unwrap();
        assert!(starred.active);
        assert_eq!(starred.content_preview.as_deref(), Some("a preview"));
        assert!(get_message_row_sync(&conn, "m1").unwrap().unwrap().starred);

        // Unstar nulls the preview columns
        assert!(update_message_starred_sync(&conn, "m1", false, None, None, None).unwrap());
        let unstarred = get_starred_sync(&conn, "m1").unwrap().unwrap();
        assert!(!unstarred.active);
        assert!(unstarred.content_preview.is_none());
        assert!(unstarred.attachment_summary.is_none());
        assert!(!get_message_row_sync(&conn, "m1").unwrap().unwrap().starred);

        // Re-star keeps the projection to one row
        update_message_starred_sync(&conn, "m1", true, Some("again"), None, Some("p1")).unwrap();
        let all = list_starred_sync(&conn, Some("c1")).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].project_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_star_missing_message_is_noop() {
        let conn = test_conn();
        assert!(
            !update_message_starred_sync(&conn, "ghost", true, Some("p"), None, None).unwrap()
        );
        assert!(get_starred_sync(&conn, "ghost").unwrap().is_none());
    }
}
