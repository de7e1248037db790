// src/db/vec_index.rs
// Lifecycle and queries for the vec_embeddings virtual table
//
// The virtual table is declared with a single fixed-dimension float column
// and keyed by rowid, which it shares with the primary `embedding` table.
// Its dimension is only known at runtime (it follows the embedding model),
// so creation is lazy and a dimension change rebuilds the table. The
// primary table is never touched by a rebuild; vectors can be re-inserted
// from it afterwards.

use crate::error::{Result, VellumError};
use crate::scope::SearchScope;
use crate::search::utils::embedding_to_bytes;
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Known state of the virtual table, cached in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Not yet probed.
    Unknown,
    /// Probed; the table does not exist.
    Absent,
    /// Probed; exists with the given dimension.
    Present(usize),
}

/// How a vector-table error should be handled.
enum VecFailure {
    MissingTable,
    DimensionMismatch { expected: usize, received: usize },
    Other,
}

/// Classify a rusqlite error by its message. sqlite-vec reports dimension
/// mismatches in prose naming the expected and received dimensions.
fn classify(err: &rusqlite::Error) -> VecFailure {
    let msg = err.to_string().to_lowercase();
    if msg.contains("no such table") && msg.contains("vec_embeddings") {
        return VecFailure::MissingTable;
    }
    if msg.contains("dimension mismatch") {
        if let Some((expected, received)) = parse_mismatch_dims(&msg) {
            return VecFailure::DimensionMismatch { expected, received };
        }
        return VecFailure::DimensionMismatch {
            expected: 0,
            received: 0,
        };
    }
    VecFailure::Other
}

/// Pull the first integer following "expected" and "received" out of an
/// already-lowercased error message.
fn parse_mismatch_dims(msg: &str) -> Option<(usize, usize)> {
    fn int_after(msg: &str, token: &str) -> Option<usize> {
        let idx = msg.find(token)? + token.len();
        let rest = &msg[idx..];
        let digits: String = rest
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }
    Some((int_after(msg, "expected")?, int_after(msg, "received")?))
}

/// The vector index component. One instance per store; the state cache is
/// only mutated through `ensure`/`recreate`/`invalidate`.
pub struct VecIndex {
    state: Mutex<IndexState>,
}

impl Default for VecIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VecIndex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexState::Unknown),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current cached state (tests and diagnostics).
    pub fn cached_state(&self) -> IndexState {
        *self.lock_state()
    }

    /// Drop the cache; the next operation re-probes.
    pub fn invalidate(&self) {
        *self.lock_state() = IndexState::Unknown;
    }

    /// Read the actual table state from sqlite_master, parsing the declared
    /// dimension out of the CREATE statement (`embedding float[N]`).
    fn probe(&self, conn: &Connection) -> Result<IndexState> {
        let sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type='table' AND name='vec_embeddings'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let state = match sql {
            None => IndexState::Absent,
            Some(sql) => match parse_declared_dim(&sql) {
                Some(dim) => IndexState::Present(dim),
                None => {
                    warn!("vec_embeddings exists but its dimension could not be parsed");
                    IndexState::Absent
                }
            },
        };
        *self.lock_state() = state;
        Ok(state)
    }

    /// Make sure the table exists. If it is absent, create it at `dim`.
    /// An existing table with a different dimension is left alone here; the
    /// writer path resolves the mismatch through `recreate` when the insert
    /// fails.
    pub fn ensure(&self, conn: &Connection, dim: usize) -> Result<IndexState> {
        if dim == 0 {
            return Err(VellumError::InvalidInput(
                "embedding dimension must be non-zero".into(),
            ));
        }
        let cached = *self.lock_state();
        let state = match cached {
            IndexState::Unknown => self.probe(conn)?,
            s => s,
        };
        match state {
            IndexState::Absent => {
                conn.execute(&create_sql(dim), [])?;
                let new_state = IndexState::Present(dim);
                *self.lock_state() = new_state;
                debug!("Created vec_embeddings at dimension {}", dim);
                Ok(new_state)
            }
            present => Ok(present),
        }
    }

    /// Drop and recreate the table at a new dimension. Destroys all vector
    /// rows; the primary embedding table is untouched and can be replayed
    /// via [`rebuild_from_primary`](Self::rebuild_from_primary).
    pub fn recreate(&self, conn: &Connection, dim: usize) -> Result<()> {
        if dim == 0 {
            return Err(VellumError::InvalidInput(
                "embedding dimension must be non-zero".into(),
            ));
        }
        warn!(
            "Recreating vec_embeddings at dimension {} (existing vector rows dropped)",
            dim
        );
        conn.execute("DROP TABLE IF EXISTS vec_embeddings", [])?;
        conn.execute(&create_sql(dim), [])?;
        *self.lock_state() = IndexState::Present(dim);
        Ok(())
    }

    /// Write one vector row, keyed by the primary table's rowid.
    ///
    /// vec0 tables do not support UPDATE, so the write is DELETE-then-INSERT.
    /// Two failure classes self-heal with a single retry each: a missing
    /// table is created, and a dimension mismatch recreates the table at the
    /// new dimension. Everything else invalidates the cache and surfaces
    /// with the backend message preserved.
    pub fn sync_row(&self, conn: &Connection, rowid: i64, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(VellumError::InvalidInput("empty embedding payload".into()));
        }
        self.ensure(conn, vector.len())?;

        match self.write_row(conn, rowid, vector) {
            Ok(()) => Ok(()),
            Err(e) => match classify(&e) {
                VecFailure::MissingTable => {
                    self.invalidate();
                    self.ensure(conn, vector.len())?;
                    self.write_row(conn, rowid, vector)
                        .map_err(|_| VellumError::VecTableMissing)
                }
                VecFailure::DimensionMismatch { expected, received } => {
                    warn!(
                        "vec_embeddings dimension mismatch (expected {}, received {}); rebuilding",
                        expected, received
                    );
                    self.recreate(conn, vector.len())?;
                    self.write_row(conn, rowid, vector).map_err(|e| {
                        VellumError::VecIndex(format!("retry after recreate failed: {e}"))
                    })
                }
                VecFailure::Other => {
                    self.invalidate();
                    Err(VellumError::VecIndex(format!("vector sync failed: {e}")))
                }
            },
        }
    }

    fn write_row(
        &self,
        conn: &Connection,
        rowid: i64,
        vector: &[f32],
    ) -> std::result::Result<(), rusqlite::Error> {
        conn.execute("DELETE FROM vec_embeddings WHERE rowid = ?", params![rowid])?;
        conn.execute(
            "INSERT INTO vec_embeddings (rowid, embedding) VALUES (?, ?)",
            params![rowid, embedding_to_bytes(vector)],
        )?;
        Ok(())
    }

    /// Remove a vector row. A missing table is not an error (there is
    /// nothing to remove).
    pub fn delete_row(&self, conn: &Connection, rowid: i64) -> Result<()> {
        match conn.execute("DELETE FROM vec_embeddings WHERE rowid = ?", params![rowid]) {
            Ok(_) => Ok(()),
            Err(e) => match classify(&e) {
                VecFailure::MissingTable => {
                    *self.lock_state() = IndexState::Absent;
                    Ok(())
                }
                _ => Err(e.into()),
            },
        }
    }

    /// Remove the vector rows for a set of primary rowids.
    pub fn delete_rows(&self, conn: &Connection, rowids: &[i64]) -> Result<()> {
        for rowid in rowids {
            self.delete_row(conn, *rowid)?;
        }
        Ok(())
    }

    /// KNN query: nearest `k` vector rows under the scope predicate,
    /// ordered by ascending distance.
    ///
    /// The scope predicate joins through the primary table so pruning
    /// happens before the LIMIT; the vec0 KNN operator requires `k = ?` in
    /// the WHERE clause alongside the MATCH expression.
    pub fn knn(
        &self,
        conn: &Connection,
        query: &[f32],
        k: usize,
        scope: &SearchScope,
    ) -> Result<Vec<(i64, f64)>> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let pred = scope.knn_predicate("d", "e");
        let sql = format!(
            "SELECT v.rowid, v.distance
             FROM vec_embeddings v
             JOIN embedding e ON e.rowid = v.rowid
             JOIN doc_meta d ON d.id = e.doc_id
             WHERE v.embedding MATCH ? AND k = ?{}
             ORDER BY v.distance",
            pred.clause
        );

        let mut values: Vec<Value> = Vec::with_capacity(2 + pred.params.len());
        values.push(Value::Blob(embedding_to_bytes(query)));
        values.push(Value::Integer(k as i64));
        values.extend(pred.params);

        let mut stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(e) => {
                return match classify(&e) {
                    VecFailure::MissingTable => {
                        *self.lock_state() = IndexState::Absent;
                        Ok(Vec::new())
                    }
                    _ => Err(e.into()),
                };
            }
        };

        let collected = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })
            .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>());
        match collected {
            Ok(rows) => Ok(rows),
            Err(e) => match classify(&e) {
                // A query vector of the wrong dimension finds nothing; the
                // caller's vectors were dropped by a recreate.
                VecFailure::DimensionMismatch { .. } => {
                    debug!("KNN query dimension does not match the index; returning empty");
                    Ok(Vec::new())
                }
                VecFailure::MissingTable => {
                    *self.lock_state() = IndexState::Absent;
                    Ok(Vec::new())
                }
                _ => Err(e.into()),
            },
        }
    }

    /// Re-insert every primary embedding whose length matches the current
    /// table dimension. Used after a recreate to restore searchability of
    /// rows that survived the model change.
    pub fn rebuild_from_primary(&self, conn: &Connection, dim: usize) -> Result<usize> {
        self.ensure(conn, dim)?;

        let mut stmt =
            conn.prepare("SELECT rowid, embedding FROM embedding WHERE embedding_len = ?")?;
        let rows: Vec<(i64, Vec<u8>)> = stmt
            .query_map(params![dim as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let tx = conn.unchecked_transaction()?;
        let mut restored = 0usize;
        {
            let mut del = tx.prepare("DELETE FROM vec_embeddings WHERE rowid = ?")?;
            let mut ins =
                tx.prepare("INSERT INTO vec_embeddings (rowid, embedding) VALUES (?, ?)")?;
            for (rowid, bytes) in &rows {
                del.execute(params![rowid])?;
                ins.execute(params![rowid, bytes])?;
                restored += 1;
            }
        }
        tx.commit()?;
        Ok(restored)
    }
}

fn create_sql(dim: usize) -> String {
    format!("CREATE VIRTUAL TABLE vec_embeddings USING vec0(embedding float[{dim}])")
}

/// Parse the declared dimension from a CREATE VIRTUAL TABLE statement.
fn parse_declared_dim(sql: &str) -> Option<usize> {
    let start = sql.find("float[")? + "float[".len();
    let rest = &sql[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
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

    fn seed_doc(conn: &Connection, doc_id: &str, path: &str) {
        conn.execute(
            "INSERT INTO doc_meta (id, path, mtime, ctime, content_hash, word_count, link_count, tags)
             VALUES (?, ?, 0, 0, 'h', 0, 0, '[]')",
            params![doc_id, path],
        )
        .unwrap();
    }

    fn seed_embedding(conn: &Connection, id: &str, doc_id: &str, vector: &[f32]) -> i64 {
        conn.execute(
            "INSERT INTO embedding (id, doc_id, content_hash, ctime, mtime, embedding, embedding_model, embedding_len)
             VALUES (?, ?, 'h', 0, 0, ?, 'test-model', ?)",
            params![id, doc_id, embedding_to_bytes(vector), vector.len() as i64],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_parse_declared_dim() {
        assert_eq!(
            parse_declared_dim("CREATE VIRTUAL TABLE vec_embeddings USING vec0(embedding float[768])"),
            Some(768)
        );
        assert_eq!(parse_declared_dim("CREATE TABLE t (x INTEGER)"), None);
    }

    #[test]
    fn test_parse_mismatch_dims() {
        let msg = "dimension mismatch for inserted vector. expected 4 dimensions but received 6.";
        assert_eq!(parse_mismatch_dims(msg), Some((4, 6)));
        assert_eq!(parse_mismatch_dims("no numbers here"), None);
    }

    #[test]
    fn test_state_machine_probe_and_ensure() {
        let conn = test_conn();
        let index = VecIndex::new();
        assert_eq!(index.cached_state(), IndexState::Unknown);

        index.ensure(&conn, 4).unwrap();
        assert_eq!(index.cached_state(), IndexState::Present(4));

        // A second index instance probes the real table
        let other = VecIndex::new();
        assert_eq!(other.probe(&conn).unwrap(), IndexState::Present(4));
    }

    #[test]
    fn test_ensure_rejects_zero_dim() {
        let conn = test_conn();
        let index = VecIndex::new();
        assert!(index.ensure(&conn, 0).is_err());
    }

    #[test]
    fn test_sync_row_and_knn_round_trip() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "notes/a.md");
        let r1 = seed_embedding(&conn, "e1", "d1", &[0.1, 0.2, 0.3, 0.4]);
        let r2 = seed_embedding(&conn, "e2", "d1", &[0.5, 0.5, 0.5, 0.5]);

        index.sync_row(&conn, r1, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        index.sync_row(&conn, r2, &[0.5, 0.5, 0.5, 0.5]).unwrap();

        let hits = index
            .knn(&conn, &[0.1, 0.2, 0.3, 0.4], 1, &SearchScope::Vault)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, r1);
        assert!(hits[0].1 < 1e-6, "distance was {}", hits[0].1);
    }

    #[test]
    fn test_sync_row_is_update_by_delete_insert() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "notes/a.md");
        let rowid = seed_embedding(&conn, "e1", "d1", &[1.0, 0.0, 0.0, 0.0]);

        index.sync_row(&conn, rowid, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.sync_row(&conn, rowid, &[0.0, 1.0, 0.0, 0.0]).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM vec_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let hits = index
            .knn(&conn, &[0.0, 1.0, 0.0, 0.0], 1, &SearchScope::Vault)
            .unwrap();
        assert_eq!(hits[0].0, rowid);
        assert!(hits[0].1 < 1e-6);
    }

    #[test]
    fn test_dimension_switch_recreates_and_keeps_primary() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "notes/a.md");
        let r1 = seed_embedding(&conn, "e1", "d1", &[0.1, 0.2, 0.3, 0.4]);
        let r2 = seed_embedding(&conn, "e2", "d1", &[0.5, 0.5, 0.5, 0.5]);
        index.sync_row(&conn, r1, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        index.sync_row(&conn, r2, &[0.5, 0.5, 0.5, 0.5]).unwrap();

        // New model produces 6-dim vectors; the write self-heals by rebuild
        let r3 = seed_embedding(&conn, "e3", "d1", &[0.0; 6]);
        index.sync_row(&conn, r3, &[0.1, 0.1, 0.1, 0.1, 0.1, 0.1]).unwrap();
        assert_eq!(index.cached_state(), IndexState::Present(6));

        // Primary table still holds all three rows
        let primary: i64 = conn
            .query_row("SELECT COUNT(*) FROM embedding", [], |r| r.get(0))
            .unwrap();
        assert_eq!(primary, 3);

        // Old 4-dim vectors are gone from the index
        let old_hits = index
            .knn(&conn, &[0.1, 0.2, 0.3, 0.4], 5, &SearchScope::Vault)
            .unwrap();
        assert!(old_hits.is_empty());

        // The 6-dim row is searchable
        let new_hits = index
            .knn(&conn, &[0.1, 0.1, 0.1, 0.1, 0.1, 0.1], 5, &SearchScope::Vault)
            .unwrap();
        assert_eq!(new_hits.len(), 1);
        assert_eq!(new_hits[0].0, r3);
    }

    #[test]
    fn test_knn_scope_in_file_soundness() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "notes/a.md");
        seed_doc(&conn, "d2", "notes/b.md");
        let r1 = seed_embedding(&conn, "e1", "d1", &[1.0, 0.0]);
        let r2 = seed_embedding(&conn, "e2", "d2", &[1.0, 0.01]);
        index.sync_row(&conn, r1, &[1.0, 0.0]).unwrap();
        index.sync_row(&conn, r2, &[1.0, 0.01]).unwrap();

        let scope = SearchScope::InFile {
            path: "notes/b.md".into(),
        };
        let hits = index.knn(&conn, &[1.0, 0.0], 10, &scope).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, r2);
    }

    #[test]
    fn test_knn_id_set_scope() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "notes/a.md");
        let r1 = seed_embedding(&conn, "e1", "d1", &[1.0, 0.0]);
        let r2 = seed_embedding(&conn, "e2", "d1", &[0.9, 0.1]);
        index.sync_row(&conn, r1, &[1.0, 0.0]).unwrap();
        index.sync_row(&conn, r2, &[0.9, 0.1]).unwrap();

        let scope = SearchScope::IdSet {
            ids: vec!["e2".into()],
        };
        let hits = index.knn(&conn, &[1.0, 0.0], 10, &scope).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, r2);
    }

    #[test]
    fn test_knn_without_table_returns_empty() {
        let conn = test_conn();
        let index = VecIndex::new();
        let hits = index.knn(&conn, &[1.0, 0.0], 5, &SearchScope::Vault).unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.cached_state(), IndexState::Absent);
    }

    #[test]
    fn test_delete_row_tolerates_missing_table() {
        let conn = test_conn();
        let index = VecIndex::new();
        index.delete_row(&conn, 42).unwrap();
        assert_eq!(index.cached_state(), IndexState::Absent);
    }

    #[test]
    fn test_rebuild_from_primary_restores_matching_rows() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "notes/a.md");
        let r1 = seed_embedding(&conn, "e1", "d1", &[0.1, 0.2, 0.3, 0.4]);
        seed_embedding(&conn, "e2", "d1", &[0.0; 6]);

        // Table at dimension 4: only the 4-dim row is replayed
        let restored = index.rebuild_from_primary(&conn, 4).unwrap();
        assert_eq!(restored, 1);

        let hits = index
            .knn(&conn, &[0.1, 0.2, 0.3, 0.4], 5, &SearchScope::Vault)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, r1);
    }

    #[test]
    fn test_sync_row_rejects_empty_vector() {
        let conn = test_conn();
        let index = VecIndex::new();
        let err = index.sync_row(&conn, 1, &[]);
        assert!(matches!(err, Err(VellumError::InvalidInput(_))));
    }
}
