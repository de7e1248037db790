// src/db/docs.rs
// Document metadata, full-text rows, behavioral statistics, link graph

use crate::db::types::{DocMeta, DocStats};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{HashMap, HashSet, VecDeque};

/// Insert or update a document's metadata row (keyed by id; path is unique).
pub fn upsert_doc_meta_sync(conn: &Connection, doc: &DocMeta) -> rusqlite::Result<()> {
    let tags = serde_json::to_string(&doc.tags).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO doc_meta (id, path, mtime, ctime, content_hash, word_count, link_count, tags)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            path = excluded.path,
            mtime = excluded.mtime,
            ctime = excluded.ctime,
            content_hash = excluded.content_hash,
            word_count = excluded.word_count,
            link_count = excluded.link_count,
            tags = excluded.tags",
        params![
            doc.id,
            doc.path,
            doc.mtime,
            doc.ctime,
            doc.content_hash,
            doc.word_count,
            doc.link_count,
            tags
        ],
    )?;
    Ok(())
}

fn parse_doc_row(row: &rusqlite::Row) -> rusqlite::Result<DocMeta> {
    let tags_json: String = row.get(7)?;
    Ok(DocMeta {
        id: row.get(0)?,
        path: row.get(1)?,
        mtime: row.get(2)?,
        ctime: row.get(3)?,
        content_hash: row.get(4)?,
        word_count: row.get(5)?,
        link_count: row.get(6)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}

const DOC_COLS: &str = "id, path, mtime, ctime, content_hash, word_count, link_count, tags";

pub fn get_doc_by_id_sync(conn: &Connection, id: &str) -> rusqlite::Result<Option<DocMeta>> {
    conn.query_row(
        &format!("SELECT {DOC_COLS} FROM doc_meta WHERE id = ?"),
        params![id],
        parse_doc_row,
    )
    .optional()
}

pub fn get_doc_by_path_sync(conn: &Connection, path: &str) -> rusqlite::Result<Option<DocMeta>> {
    conn.query_row(
        &format!("SELECT {DOC_COLS} FROM doc_meta WHERE path = ?"),
        params![path],
        parse_doc_row,
    )
    .optional()
}

/// Remove a document row. Embedding cleanup is the caller's concern (the
/// store deletes embeddings + vector rows first, then the meta row).
pub fn delete_doc_meta_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let n = conn.execute("DELETE FROM doc_meta WHERE id = ?", params![id])?;
    conn.execute("DELETE FROM doc_fts WHERE doc_id = ?", params![id])?;
    Ok(n > 0)
}

/// Replace a document's full-text row (external ingestion writes through
/// this; FTS5 has no upsert).
pub fn upsert_doc_fts_sync(
    conn: &Connection,
    doc_id: &str,
    path: &str,
    title: &str,
    body: &str,
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM doc_fts WHERE doc_id = ?", params![doc_id])?;
    conn.execute(
        "INSERT INTO doc_fts (doc_id, path, title, body) VALUES (?, ?, ?, ?)",
        params![doc_id, path, title, body],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Behavioral statistics
// ---------------------------------------------------------------------------

/// Bump the open counter for a document path.
pub fn record_doc_open_sync(conn: &Connection, path: &str, ts_ms: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO doc_statistics (path, open_count, last_open_ts)
         VALUES (?, 1, ?)
         ON CONFLICT(path) DO UPDATE SET
            open_count = open_count + 1,
            last_open_ts = excluded.last_open_ts",
        params![path, ts_ms],
    )?;
    Ok(())
}

pub fn get_doc_stats_sync(conn: &Connection, path: &str) -> rusqlite::Result<DocStats> {
    conn.query_row(
        "SELECT open_count, last_open_ts FROM doc_statistics WHERE path = ?",
        params![path],
        |row| {
            Ok(DocStats {
                open_count: row.get(0)?,
                last_open_ts: row.get(1)?,
            })
        },
    )
    .optional()
    .map(Option::unwrap_or_default)
}

/// Batch statistics lookup for reranking candidates.
pub fn stats_for_paths_sync(
    conn: &Connection,
    paths: &[String],
) -> rusqlite::Result<HashMap<String, DocStats>> {
    let mut stmt =
        conn.prepare("SELECT open_count, last_open_ts FROM doc_statistics WHERE path = ?")?;
    let mut out = HashMap::with_capacity(paths.len());
    for path in paths {
        let stats = stmt
            .query_row(params![path], |row| {
                Ok(DocStats {
                    open_count: row.get(0)?,
                    last_open_ts: row.get(1)?,
                })
            })
            .optional()?;
        if let Some(stats) = stats {
            out.insert(path.clone(), stats);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Link graph
// ---------------------------------------------------------------------------

/// Replace the outgoing edges of a source document.
pub fn replace_doc_edges_sync(
    conn: &Connection,
    src_path: &str,
    dst_paths: &[String],
) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM graph_edge WHERE src_path = ?", params![src_path])?;
    {
        let mut ins = tx.prepare(
            "INSERT OR IGNORE INTO graph_edge (src_path, dst_path) VALUES (?, ?)",
        )?;
        for dst in dst_paths {
            ins.execute(params![src_path, dst])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Undirected neighbors of a path (both edge directions).
fn neighbors_sync(conn: &Connection, path: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT dst_path FROM graph_edge WHERE src_path = ?1
         UNION
         SELECT src_path FROM graph_edge WHERE dst_path = ?1",
    )?;
    let rows = stmt.query_map(params![path], |row| row.get(0))?;
    rows.collect()
}

/// Paths reachable from `anchor` within `max_hops` undirected hops,
/// excluding the anchor itself. Small BFS; vault link graphs are sparse.
pub fn paths_within_hops_sync(
    conn: &Connection,
    anchor: &str,
    max_hops: usize,
) -> rusqlite::Result<HashSet<String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((anchor.to_string(), 0));

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(anchor.to_string());

    while let Some((path, depth)) = queue.pop_front() {
        if depth >= max_hops {
            continue;
        }
        for neighbor in neighbors_sync(conn, &path)? {
            if visited.insert(neighbor.clone()) {
                seen.insert(neighbor.clone());
                queue.push_back((neighbor, depth + 1));
            }
        }
    }
    Ok(seen)
}

// ---------------------------------------------------------------------------
// Durable counters
// ---------------------------------------------------------------------------

pub fn get_index_state_sync(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM index_state WHERE key = ?",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_index_state_sync(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO index_state (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    fn test_conn() -> Connection {
        crate::db::pool::ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn
    }

    fn doc(id: &str, path: &str) -> DocMeta {
        DocMeta {
            id: id.into(),
            path: path.into(),
            mtime: 10,
            ctime: 5,
            content_hash: "h".into(),
            word_count: 100,
            link_count: 2,
            tags: vec!["daily".into()],
        }
    }

    #[test]
    fn test_doc_meta_upsert_round_trip() {
        let conn = test_conn();
        let d = doc("d1", "notes/a.md");
        upsert_doc_meta_sync(&conn, &d).unwrap();

        let loaded = get_doc_by_id_sync(&conn, "d1").unwrap().unwrap();
        assert_eq!(loaded, d);
        assert_eq!(
            get_doc_by_path_sync(&conn, "notes/a.md").unwrap().unwrap().id,
            "d1"
        );

        // Update in place
        let mut d2 = d.clone();
        d2.word_count = 200;
        upsert_doc_meta_sync(&conn, &d2).unwrap();
        assert_eq!(
            get_doc_by_id_sync(&conn, "d1").unwrap().unwrap().word_count,
            200
        );
    }

    #[test]
    fn test_delete_doc_meta() {
        let conn = test_conn();
        upsert_doc_meta_sync(&conn, &doc("d1", "a.md")).unwrap();
        upsert_doc_fts_sync(&conn, "d1", "a.md", "A", "body text").unwrap();

        assert!(delete_doc_meta_sync(&conn, "d1").unwrap());
        assert!(get_doc_by_id_sync(&conn, "d1").unwrap().is_none());
        assert!(!delete_doc_meta_sync(&conn, "d1").unwrap());
    }

    #[test]
    fn test_doc_stats_accumulate() {
        let conn = test_conn();
        record_doc_open_sync(&conn, "a.md", 1000).unwrap();
        record_doc_open_sync(&conn, "a.md", 2000).unwrap();

        let stats = get_doc_stats_sync(&conn, "a.md").unwrap();
        assert_eq!(stats.open_count, 2);
        assert_eq!(stats.last_open_ts, Some(2000));

        // Unknown paths yield the zero default
        let none = get_doc_stats_sync(&conn, "missing.md").unwrap();
        assert_eq!(none.open_count, 0);
        assert!(none.last_open_ts.is_none());
    }

    #[test]
    fn test_stats_for_paths_batch() {
        let conn = test_conn();
        record_doc_open_sync(&conn, "a.md", 1000).unwrap();
        let map = stats_for_paths_sync(&conn, &["a.md".into(), "b.md".into()]).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["a.md"].open_count, 1);
    }

    #[test]
    fn test_graph_two_hops_undirected() {
        let conn = test_conn();
        // a -> b -> c -> d ; e isolated
        replace_doc_edges_sync(&conn, "a.md", &["b.md".into()]).unwrap();
        replace_doc_edges_sync(&conn, "b.md", &["c.md".into()]).unwrap();
        replace_doc_edges_sync(&conn, "c.md", &["d.md".into()]).unwrap();

        let near = paths_within_hops_sync(&conn, "a.md", 2).unwrap();
        assert!(near.contains("b.md"));
        assert!(near.contains("c.md"));
        assert!(!near.contains("d.md"));
        assert!(!near.contains("a.md"));

        // Undirected: reachable against edge direction too
        let near_c = paths_within_hops_sync(&conn, "c.md", 2).unwrap();
        assert!(near_c.contains("b.md"));
        assert!(near_c.contains("a.md"));
        assert!(near_c.contains("d.md"));
    }

    #[test]
    fn test_replace_doc_edges_clears_previous() {
        let conn = test_conn();
        replace_doc_edges_sync(&conn, "a.md", &["b.md".into()]).unwrap();
        replace_doc_edges_sync(&conn, "a.md", &["c.md".into()]).unwrap();

        let near = paths_within_hops_sync(&conn, "a.md", 1).unwrap();
        assert!(!near.contains("b.md"));
        assert!(near.contains("c.md"));
    }

    #[test]
    fn test_index_state_round_trip() {
        let conn = test_conn();
        assert!(get_index_state_sync(&conn, "archiver.last_run").unwrap().is_none());
        set_index_state_sync(&conn, "archiver.last_run", "123").unwrap();
        set_index_state_sync(&conn, "archiver.last_run", "456").unwrap();
        assert_eq!(
            get_index_state_sync(&conn, "archiver.last_run").unwrap().as_deref(),
            Some("456")
        );
    }
}
