// src/scope.rs
// Search scope resolution: abstract scopes to SQL predicate fragments

use rusqlite::types::Value;

/// Which slice of the corpus a search may return.
///
/// Exactly one mode applies per query; callers that have no opinion use
/// [`SearchScope::Vault`].
#[derive(Debug, Clone, PartialEq)]
pub enum SearchScope {
    /// Whole corpus, no extra constraint.
    Vault,
    /// A single document by exact path.
    InFile { path: String },
    /// A folder and everything under it.
    InFolder { path: String },
    /// An explicit set of embedding ids.
    IdSet { ids: Vec<String> },
}

impl Default for SearchScope {
    fn default() -> Self {
        SearchScope::Vault
    }
}

/// A rendered predicate: SQL fragment (starting with ` AND ` or empty) plus
/// its positional parameters, appended after the caller's own.
#[derive(Debug)]
pub struct ScopePredicate {
    pub clause: String,
    pub params: Vec<Value>,
}

impl ScopePredicate {
    fn none() -> Self {
        Self {
            clause: String::new(),
            params: Vec::new(),
        }
    }
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?")
        .take(n)
        .collect::<Vec<_>>()
        .join(", ")
}

impl SearchScope {
    /// Predicate over the document table alone. Used by the keyword branch,
    /// where no embedding row is in scope; the id-set mode falls back to an
    /// EXISTS probe against the embedding table.
    pub fn doc_predicate(&self, doc: &str) -> ScopePredicate {
        match self {
            SearchScope::Vault => ScopePredicate::none(),
            SearchScope::InFile { path } => ScopePredicate {
                clause: format!(" AND {doc}.path = ?"),
                params: vec![Value::Text(path.clone())],
            },
            SearchScope::InFolder { path } => ScopePredicate {
                clause: format!(" AND ({doc}.path = ? OR {doc}.path LIKE ?)"),
                params: vec![
                    Value::Text(path.clone()),
                    Value::Text(format!("{}/%", path.trim_end_matches('/'))),
                ],
            },
            SearchScope::IdSet { ids } => {
                if ids.is_empty() {
                    // An empty id set matches nothing.
                    return ScopePredicate {
                        clause: " AND 0".into(),
                        params: Vec::new(),
                    };
                }
                ScopePredicate {
                    clause: format!(
                        " AND EXISTS (SELECT 1 FROM embedding se WHERE se.doc_id = {doc}.id AND se.id IN ({}))",
                        placeholders(ids.len())
                    ),
                    params: ids.iter().cloned().map(Value::Text).collect(),
                }
            }
        }
    }

    /// Predicate for the KNN join, where both the document table and the
    /// embedding table are available by alias.
    pub fn knn_predicate(&self, doc: &str, emb: &str) -> ScopePredicate {
        match self {
            SearchScope::IdSet { ids } => {
                if ids.is_empty() {
                    return ScopePredicate {
                        clause: " AND 0".into(),
                        params: Vec::new(),
                    };
                }
                ScopePredicate {
                    clause: format!(" AND {emb}.id IN ({})", placeholders(ids.len())),
                    params: ids.iter().cloned().map(Value::Text).collect(),
                }
            }
            other => other.doc_predicate(doc),
        }
    }
}
