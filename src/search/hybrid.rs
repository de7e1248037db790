// src/search/hybrid.rs
// Keyword + vector fusion with reciprocal rank fusion ordering

use crate::db::vec_index::VecIndex;
use crate::error::Result;
use crate::scope::SearchScope;
use crate::search::keyword::keyword_search_sync;
use crate::search::vector::vector_search_sync;
use rusqlite::Connection;
use std::collections::HashMap;

/// Which branch produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Keyword,
    Vector,
    Both,
}

impl std::fmt::Display for MatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchSource::Keyword => write!(f, "keyword"),
            MatchSource::Vector => write!(f, "vector"),
            MatchSource::Both => write!(f, "both"),
        }
    }
}

/// A merged, document-level search hit. `base_score` is the RRF fusion
/// value; `final_score` starts equal to it and is adjusted by the reranker.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub doc_id: String,
    pub path: String,
    pub keyword_score: Option<f32>,
    pub vector_score: Option<f32>,
    pub source: MatchSource,
    pub base_score: f32,
    pub final_score: f32,
}

/// RRF fusion constant; dampens the effect of high ranks.
pub const RRF_K: f32 = 60.0;

/// Run both branches under one scope and merge per document.
///
/// Deduplication key is the doc id, keeping the best per-side score (the
/// vector branch is chunk-level, so one document may hit several times).
/// Each side's scores are already normalized to [0, 1]; the merged ordering
/// is reciprocal rank fusion over the two ranked lists.
pub fn hybrid_search_sync(
    conn: &Connection,
    index: &VecIndex,
    query: &str,
    query_embedding: Option<&[f32]>,
    scope: &SearchScope,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let keyword_hits = keyword_search_sync(conn, query, scope, limit)?;

    // Over-fetch chunks so per-document dedup still fills the limit.
    let vector_hits = match query_embedding {
        Some(embedding) => vector_search_sync(conn, index, embedding, scope, limit * 4)?,
        None => Vec::new(),
    };

    // Best score per document on each side, in rank order.
    let mut keyword_ranked: Vec<(String, String, f32)> = Vec::new();
    for hit in &keyword_hits {
        if !keyword_ranked.iter().any(|(id, _, _)| id == &hit.doc_id) {
            keyword_ranked.push((hit.doc_id.clone(), hit.path.clone(), hit.score));
        }
    }
    let mut vector_ranked: Vec<(String, String, f32)> = Vec::new();
    for hit in &vector_hits {
        if !vector_ranked.iter().any(|(id, _, _)| id == &hit.doc_id) {
            vector_ranked.push((hit.doc_id.clone(), hit.path.clone(), hit.score));
        }
    }
    vector_ranked.truncate(limit);

    // Merge + RRF
    let mut merged: HashMap<String, SearchHit> = HashMap::new();
    for (rank, (doc_id, path, score)) in keyword_ranked.iter().enumerate() {
        let rrf = 1.0 / (RRF_K + rank as f32 + 1.0);
        merged.insert(
            doc_id.clone(),
            SearchHit {
                doc_id: doc_id.clone(),
                path: path.clone(),
                keyword_score: Some(*score),
                vector_score: None,
                source: MatchSource::Keyword,
                base_score: rrf,
                final_score: rrf,
            },
        );
    }
    for (rank, (doc_id, path, score)) in vector_ranked.iter().enumerate() {
        let rrf = 1.0 / (RRF_K + rank as f32 + 1.0);
        match merged.get_mut(doc_id) {
            Some(hit) => {
                hit.vector_score = Some(*score);
                hit.source = MatchSource::Both;
                hit.base_score += rrf;
                hit.final_score = hit.base_score;
            }
            None => {
                merged.insert(
                    doc_id.clone(),
                    SearchHit {
                        doc_id: doc_id.clone(),
                        path: path.clone(),
                        keyword_score: None,
                        vector_score: Some(*score),
                        source: MatchSource::Vector,
                        base_score: rrf,
                        final_score: rrf,
                    },
                );
            }
        }
    }

    let mut results: Vec<SearchHit> = merged.into_values().collect();
    results.sort_by(|a, b| {
        b.base_score
            .partial_cmp(&a.base_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(limit);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;
    use crate::db::types::EmbeddingRecord;
    use crate::db::{upsert_doc_fts_sync, upsert_doc_meta_sync, upsert_embedding_sync};
    use crate::db::DocMeta;

    fn test_conn() -> Connection {
        crate::db::pool::ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn
    }

    fn seed_doc(conn: &Connection, id: &str, path: &str, body: &str) {
        upsert_doc_meta_sync(
            conn,
            &DocMeta {
                id: id.into(),
                path: path.into(),
                mtime: 0,
                ctime: 0,
                content_hash: "h".into(),
                word_count: 0,
                link_count: 0,
                tags: vec![],
            },
        )
        .unwrap();
        upsert_doc_fts_sync(conn, id, path, path, body).unwrap();
    }

    fn seed_embedding(conn: &Connection, index: &VecIndex, id: &str, doc_id: &str, v: Vec<f32>) {
        upsert_embedding_sync(
            conn,
            index,
            &EmbeddingRecord {
                id: id.into(),
                doc_id: doc_id.into(),
                chunk_id: None,
                chunk_index: None,
                content_hash: "h".into(),
                ctime: 0,
                mtime: 0,
                embedding: v,
                embedding_model: "m".into(),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_merge_tags_sources() {
        let conn = test_conn();
        let index = VecIndex::new();
        // d1 hits both branches; d2 keyword only; d3 vector only
        seed_doc(&conn, "d1", "a.md", "rust ownership rules");
        seed_doc(&conn, "d2", "b.md", "rust borrow checker");
        seed_doc(&conn, "d3", "c.md", "unrelated gardening");
        seed_embedding(&conn, &index, "e1", "d1", vec![1.0, 0.0]);
        seed_embedding(&conn, &index, "e3", "d3", vec![0.9, 0.1]);

        let hits = hybrid_search_sync(
            &conn,
            &index,
            "rust",
            Some(&[1.0, 0.0]),
            &SearchScope::Vault,
            10,
        )
        .unwrap();

        let by_id: HashMap<&str, &SearchHit> =
            hits.iter().map(|h| (h.doc_id.as_str(), h)).collect();
        assert_eq!(by_id["d1"].source, MatchSource::Both);
        assert_eq!(by_id["d2"].source, MatchSource::Keyword);
        assert_eq!(by_id["d3"].source, MatchSource::Vector);

        // A document found by both branches outranks single-branch hits
        assert_eq!(hits[0].doc_id, "d1");
        assert!(by_id["d1"].base_score > by_id["d2"].base_score);
    }

    #[test]
    fn test_dedup_per_document_keeps_best_chunk() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "a.md", "text");
        seed_embedding(&conn, &index, "e1", "d1", vec![1.0, 0.0]);
        seed_embedding(&conn, &index, "e2", "d1", vec![0.5, 0.5]);

        let hits = hybrid_search_sync(
            &conn,
            &index,
            "zzz_nomatch",
            Some(&[1.0, 0.0]),
            &SearchScope::Vault,
            10,
        )
        .unwrap();
        assert_eq!(hits.len(), 1);
        // Best chunk's score survives (nearest chunk has distance ~0)
        assert!(hits[0].vector_score.unwrap() > 0.9);
    }

    #[test]
    fn test_keyword_only_when_no_embedding() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "a.md", "tomato plants");

        let hits =
            hybrid_search_sync(&conn, &index, "tomato", None, &SearchScope::Vault, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, MatchSource::Keyword);
        assert!(hits[0].vector_score.is_none());
    }

    #[test]
    fn test_scope_prunes_both_branches() {
        let conn = test_conn();
        let index = VecIndex::new();
        seed_doc(&conn, "d1", "notes/a.md", "shared topic");
        seed_doc(&conn, "d2", "other/b.md", "shared topic");
        seed_embedding(&conn, &index, "e1", "d1", vec![1.0, 0.0]);
        seed_embedding(&conn, &index, "e2", "d2", vec![1.0, 0.0]);

        let scope = SearchScope::InFolder { path: "notes".into() };
        let hits =
            hybrid_search_sync(&conn, &index, "shared", Some(&[1.0, 0.0]), &scope, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "notes/a.md");
    }

    #[test]
    fn test_limit_zero() {
        let conn = test_conn();
        let index = VecIndex::new();
        assert!(hybrid_search_sync(&conn, &index, "q", None, &SearchScope::Vault, 0)
            .unwrap()
            .is_empty());
    }
}
