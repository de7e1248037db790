// src/db/schema.rs
// Database schema and migrations
//
// The vec_embeddings virtual table is NOT part of the static schema: its
// dimension is only known once the first embedding arrives, so the vector
// index component creates it lazily (see db/vec_index.rs).

use anyhow::Result;
use rusqlite::Connection;

/// Run all schema setup and migrations.
///
/// Called during pool initialization. Idempotent - existing tables and
/// columns are left alone.
pub fn run_all_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    migrate_conversation_archived(conn)?;
    migrate_project_archived(conn)?;
    Ok(())
}

/// Database schema SQL
pub const SCHEMA: &str = r#"
-- =======================================
-- CORPUS: documents and embeddings
-- =======================================
CREATE TABLE IF NOT EXISTS doc_meta (
    id TEXT PRIMARY KEY,
    path TEXT UNIQUE NOT NULL,
    mtime INTEGER NOT NULL DEFAULT 0,
    ctime INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT NOT NULL DEFAULT '',
    word_count INTEGER NOT NULL DEFAULT 0,
    link_count INTEGER NOT NULL DEFAULT 0,
    tags TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_doc_meta_path ON doc_meta(path);

-- The implicit SQLite rowid of each embedding row is shared with the
-- vec_embeddings virtual table; the vector index joins on it.
CREATE TABLE IF NOT EXISTS embedding (
    id TEXT UNIQUE NOT NULL,
    doc_id TEXT NOT NULL,
    chunk_id TEXT,
    chunk_index INTEGER,
    content_hash TEXT NOT NULL,
    ctime INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL DEFAULT 0,
    embedding BLOB NOT NULL,
    embedding_model TEXT NOT NULL,
    embedding_len INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embedding_doc ON embedding(doc_id);

-- Full-text index over document text (keyword branch of hybrid search).
-- Populated by the external ingestion pipeline alongside doc_meta.
CREATE VIRTUAL TABLE IF NOT EXISTS doc_fts USING fts5(
    doc_id UNINDEXED,
    path UNINDEXED,
    title,
    body
);

-- =======================================
-- BEHAVIOR: per-document statistics and link graph
-- =======================================
CREATE TABLE IF NOT EXISTS doc_statistics (
    path TEXT PRIMARY KEY,
    open_count INTEGER NOT NULL DEFAULT 0,
    last_open_ts INTEGER
);

CREATE TABLE IF NOT EXISTS graph_edge (
    src_path TEXT NOT NULL,
    dst_path TEXT NOT NULL,
    PRIMARY KEY (src_path, dst_path)
);
CREATE INDEX IF NOT EXISTS idx_graph_edge_dst ON graph_edge(dst_path);

-- =======================================
-- CHAT: projects, conversations, messages
-- =======================================
CREATE TABLE IF NOT EXISTS chat_project (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    folder_rel_path TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    context_json TEXT
);

CREATE TABLE IF NOT EXISTS chat_conversation (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    project_id TEXT REFERENCES chat_project(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    active_model TEXT,
    active_provider TEXT,
    token_usage_total INTEGER NOT NULL DEFAULT 0,
    title_manually_edited INTEGER NOT NULL DEFAULT 0,
    title_auto_updated INTEGER NOT NULL DEFAULT 0,
    attachment_handling TEXT,
    output_control_json TEXT,
    context_last_updated_ts INTEGER,
    context_last_message_index INTEGER NOT NULL DEFAULT 0,
    file_rel_path TEXT NOT NULL,
    context_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_conversation_project ON chat_conversation(project_id);
CREATE INDEX IF NOT EXISTS idx_conversation_updated ON chat_conversation(updated_at DESC);

-- Message bodies live in the conversation note file; rows here carry only
-- the content hash plus metadata.
CREATE TABLE IF NOT EXISTS chat_message (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES chat_conversation(id),
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    model TEXT,
    provider TEXT,
    starred INTEGER NOT NULL DEFAULT 0,
    is_error INTEGER NOT NULL DEFAULT 0,
    is_visible INTEGER NOT NULL DEFAULT 1,
    gen_time_ms INTEGER,
    token_usage_json TEXT,
    reasoning TEXT,
    tool_calls_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_message_conversation
    ON chat_message(conversation_id, created_at);

CREATE TABLE IF NOT EXISTS message_resource (
    message_id TEXT NOT NULL REFERENCES chat_message(id),
    conversation_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    source TEXT NOT NULL,
    kind TEXT NOT NULL,
    title TEXT,
    PRIMARY KEY (message_id, resource_id)
);
CREATE INDEX IF NOT EXISTS idx_message_resource_conv
    ON message_resource(conversation_id);

CREATE TABLE IF NOT EXISTS starred_message (
    source_message_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    project_id TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    content_preview TEXT,
    attachment_summary TEXT
);
CREATE INDEX IF NOT EXISTS idx_starred_conversation
    ON starred_message(conversation_id);

-- =======================================
-- SYSTEM: durable counters
-- =======================================
CREATE TABLE IF NOT EXISTS index_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// True if `table` has a column named `column`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Older databases predate soft archiving; add the flag column.
fn migrate_conversation_archived(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "chat_conversation", "archived")? {
        conn.execute(
            "ALTER TABLE chat_conversation ADD COLUMN archived INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn migrate_project_archived(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "chat_project", "archived")? {
        conn.execute(
            "ALTER TABLE chat_project ADD COLUMN archived INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        super::super::pool::ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = test_conn();
        run_all_migrations(&conn).unwrap();
        run_all_migrations(&conn).unwrap();
    }

    #[test]
    fn test_expected_tables_exist() {
        let conn = test_conn();
        for table in [
            "doc_meta",
            "embedding",
            "doc_fts",
            "doc_statistics",
            "graph_edge",
            "chat_project",
            "chat_conversation",
            "chat_message",
            "message_resource",
            "starred_message",
            "index_state",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = ?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_archived_columns_added() {
        let conn = test_conn();
        assert!(column_exists(&conn, "chat_conversation", "archived").unwrap());
        assert!(column_exists(&conn, "chat_project", "archived").unwrap());
    }

    #[test]
    fn test_role_check_constraint() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO chat_conversation (id, title, created_at, updated_at, file_rel_path)
             VALUES ('c1', 't', 0, 0, 'c1.md')",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "INSERT INTO chat_message (id, conversation_id, role, content_hash, created_at)
             VALUES ('m1', 'c1', 'robot', 'h', 0)",
            [],
        );
        assert!(err.is_err());
    }
}
