// src/search/keyword.rs
// FTS5-powered keyword search over document text

use crate::scope::SearchScope;
use crate::search::utils::bm25_to_score;
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};

/// One keyword match: a document and its normalized score.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub doc_id: String,
    pub path: String,
    pub score: f32,
}

/// Keyword search over the full-text index, pruned by the scope predicate
/// before the LIMIT. Returns hits best-first.
pub fn keyword_search_sync(
    conn: &Connection,
    query: &str,
    scope: &SearchScope,
    limit: usize,
) -> rusqlite::Result<Vec<KeywordHit>> {
    let fts_query = build_fts_query(query);
    if fts_query.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let pred = scope.doc_predicate("d");
    let sql = format!(
        "SELECT doc_fts.doc_id, doc_fts.path, bm25(doc_fts) AS rank
         FROM doc_fts
         JOIN doc_meta d ON d.id = doc_fts.doc_id
         WHERE doc_fts MATCH ?{}
         ORDER BY rank
         LIMIT ?",
        pred.clause
    );

    let mut values: Vec<Value> = Vec::with_capacity(2 + pred.params.len());
    values.push(Value::Text(fts_query));
    values.extend(pred.params);
    values.push(Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok(KeywordHit {
            doc_id: row.get(0)?,
            path: row.get(1)?,
            score: bm25_to_score(row.get::<_, f64>(2)?),
        })
    })?;
    rows.collect()
}

/// Build an FTS5 query from user input: escaped terms OR-joined, with a
/// prefix star on the last term for partial matching.
fn build_fts_query(query: &str) -> String {
    let terms: Vec<&str> = query.split_whitespace().filter(|t| !t.is_empty()).collect();
    if terms.is_empty() {
        return String::new();
    }

    let mut parts: Vec<String> = Vec::with_capacity(terms.len());
    for term in &terms {
        let cleaned = escape_fts_term(term);
        if !cleaned.is_empty() {
            parts.push(cleaned);
        }
    }
    if parts.is_empty() {
        return String::new();
    }
    if let Some(last) = parts.last_mut() {
        last.push('*');
    }
    parts.join(" OR ")
}

/// Strip FTS5 operator characters; only alphanumerics and underscores
/// survive.
fn escape_fts_term(term: &str) -> String {
    term.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}
