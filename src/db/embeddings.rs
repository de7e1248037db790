// src/db/embeddings.rs
// Primary embedding table operations, kept in lockstep with the vector index

use crate::db::types::EmbeddingRecord;
use crate::db::vec_index::VecIndex;
use crate::error::{Result, VellumError};
use crate::search::utils::{bytes_to_embedding, embedding_to_bytes};
use rusqlite::{Connection, OptionalExtension, params};

/// Insert or update one embedding and synchronize its vector row.
///
/// An existing `id` is updated in place so the rowid (shared with
/// vec_embeddings) survives. Returns the rowid. An empty payload is
/// rejected before any write happens.
pub fn upsert_embedding_sync(
    conn: &Connection,
    index: &VecIndex,
    rec: &EmbeddingRecord,
) -> Result<i64> {
    if rec.embedding.is_empty() {
        return Err(VellumError::InvalidInput(
            "embedding payload must not be empty".into(),
        ));
    }
    if rec.id.is_empty() || rec.doc_id.is_empty() {
        return Err(VellumError::InvalidInput(
            "embedding id and doc_id are required".into(),
        ));
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT rowid FROM embedding WHERE id = ?",
            params![rec.id],
            |row| row.get(0),
        )
        .optional()?;

    let bytes = embedding_to_bytes(&rec.embedding);
    let len = rec.embedding.len() as i64;

    let rowid = match existing {
        Some(rowid) => {
            conn.execute(
                "UPDATE embedding
                 SET doc_id = ?, chunk_id = ?, chunk_index = ?, content_hash = ?,
                     ctime = ?, mtime = ?, embedding = ?, embedding_model = ?, embedding_len = ?
                 WHERE rowid = ?",
                params![
                    rec.doc_id,
                    rec.chunk_id,
                    rec.chunk_index,
                    rec.content_hash,
                    rec.ctime,
                    rec.mtime,
                    bytes,
                    rec.embedding_model,
                    len,
                    rowid
                ],
            )?;
            rowid
        }
        None => {
            conn.execute(
                "INSERT INTO embedding
                 (id, doc_id, chunk_id, chunk_index, content_hash, ctime, mtime,
                  embedding, embedding_model, embedding_len)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    rec.id,
                    rec.doc_id,
                    rec.chunk_id,
                    rec.chunk_index,
                    rec.content_hash,
                    rec.ctime,
                    rec.mtime,
                    bytes,
                    rec.embedding_model,
                    len
                ],
            )?;
            conn.last_insert_rowid()
        }
    };

    index.sync_row(conn, rowid, &rec.embedding)?;
    Ok(rowid)
}

/// Delete one embedding by id, including its vector row. Missing ids are a
/// no-op.
pub fn delete_embedding_sync(conn: &Connection, index: &VecIndex, id: &str) -> Result<bool> {
    let rowid: Option<i64> = conn
        .query_row(
            "SELECT rowid FROM embedding WHERE id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(rowid) = rowid else {
        return Ok(false);
    };

    index.delete_row(conn, rowid)?;
    conn.execute("DELETE FROM embedding WHERE rowid = ?", params![rowid])?;
    Ok(true)
}

/// Delete all embeddings (and vector rows) for a document. Returns how many
/// rows were removed.
pub fn delete_embeddings_by_doc_sync(
    conn: &Connection,
    index: &VecIndex,
    doc_id: &str,
) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT rowid FROM embedding WHERE doc_id = ?")?;
    let rowids: Vec<i64> = stmt
        .query_map(params![doc_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    index.delete_rows(conn, &rowids)?;
    conn.execute("DELETE FROM embedding WHERE doc_id = ?", params![doc_id])?;
    Ok(rowids.len())
}

/// Load one embedding by id.
pub fn get_embedding_sync(conn: &Connection, id: &str) -> Result<Option<EmbeddingRecord>> {
    conn.query_row(
        "SELECT id, doc_id, chunk_id, chunk_index, content_hash, ctime, mtime,
                embedding, embedding_model
         FROM embedding WHERE id = ?",
        params![id],
        |row| {
            Ok(EmbeddingRecord {
                id: row.get(0)?,
                doc_id: row.get(1)?,
                chunk_id: row.get(2)?,
                chunk_index: row.get(3)?,
                content_hash: row.get(4)?,
                ctime: row.get(5)?,
                mtime: row.get(6)?,
                embedding: bytes_to_embedding(&row.get::<_, Vec<u8>>(7)?),
                embedding_model: row.get(8)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Identity of an embedding row resolved from a KNN hit.
#[derive(Debug, Clone)]
pub struct EmbeddingIdentity {
    pub rowid: i64,
    pub id: String,
    pub doc_id: String,
    pub doc_path: String,
}

/// Map KNN result rowids back to embedding/document identities. Order of
/// the input is preserved in the output; unknown rowids are skipped.
pub fn identities_for_rowids_sync(
    conn: &Connection,
    rowids: &[i64],
) -> Result<Vec<EmbeddingIdentity>> {
    let mut stmt = conn.prepare(
        "SELECT e.rowid, e.id, e.doc_id, d.path
         FROM embedding e JOIN doc_meta d ON d.id = e.doc_id
         WHERE e.rowid = ?",
    )?;
    let mut out = Vec::with_capacity(rowids.len());
    for rowid in rowids {
        let identity = stmt
            .query_row(params![rowid], |row| {
                Ok(EmbeddingIdentity {
                    rowid: row.get(0)?,
                    id: row.get(1)?,
                    doc_id: row.get(2)?,
                    doc_path: row.get(3)?,
                })
            })
            .optional()?;
        if let Some(identity) = identity {
            out.push(identity);
        }
    }
    Ok(out)
}

/// Count embedding rows (diagnostics and tests).
pub fn count_embeddings_sync(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM embedding", [], |r| r.get(0))
        .unwrap_or(0)
}
