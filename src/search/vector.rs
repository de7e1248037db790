// src/search/vector.rs
// Vector branch of hybrid search: KNN over the sqlite-vec index

use crate::db::vec_index::VecIndex;
use crate::db::{EmbeddingIdentity, identities_for_rowids_sync};
use crate::error::Result;
use crate::scope::SearchScope;
use crate::search::utils::distance_to_score;
use rusqlite::Connection;

/// One chunk-level vector match.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub embedding_id: String,
    pub doc_id: String,
    pub path: String,
    pub distance: f64,
    pub score: f32,
}

/// KNN over the vector index, resolved back to embedding/document
/// identities. Hits come back nearest-first; unknown rowids (a vector row
/// whose primary row vanished mid-query) are dropped.
pub fn vector_search_sync(
    conn: &Connection,
    index: &VecIndex,
    query_embedding: &[f32],
    scope: &SearchScope,
    limit: usize,
) -> Result<Vec<VectorHit>> {
    let knn = index.knn(conn, query_embedding, limit, scope)?;
    if knn.is_empty() {
        return Ok(Vec::new());
    }

    let rowids: Vec<i64> = knn.iter().map(|(rowid, _)| *rowid).collect();
    let identities = identities_for_rowids_sync(conn, &rowids)?;

    let mut out = Vec::with_capacity(knn.len());
    for ((rowid, distance), identity) in knn.iter().zip(identity_iter(&identities, &rowids)) {
        let Some(identity) = identity else { continue };
        debug_assert_eq!(*rowid, identity.rowid);
        out.push(VectorHit {
            embedding_id: identity.id.clone(),
            doc_id: identity.doc_id.clone(),
            path: identity.doc_path.clone(),
            distance: *distance,
            score: distance_to_score(*distance as f32),
        });
    }
    Ok(out)
}

/// Pair each requested rowid with its resolved identity (identities keep
/// input order but skip unknowns).
fn identity_iter<'a>(
    identities: &'a [EmbeddingIdentity],
    rowids: &'a [i64],
) -> impl Iterator<Item = Option<&'a EmbeddingIdentity>> + 'a {
    let mut by_rowid: std::collections::HashMap<i64, &EmbeddingIdentity> =
        std::collections::HashMap::with_capacity(identities.len());
    for identity in identities {
        by_rowid.insert(identity.rowid, identity);
    }
    rowids.iter().map(move |rowid| by_rowid.get(rowid).copied())
}
