// src/search/rerank.rs
// Behavioral and graph boosts plus optional LLM rerank with score blending

use crate::db::types::DocStats;
use crate::db::{DatabasePool, paths_within_hops_sync, stats_for_paths_sync};
use crate::error::Result;
use crate::llm::{LlmProvider, RerankDocument};
use crate::search::hybrid::SearchHit;
use crate::utils::now_ms;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub const FREQUENCY_BOOST_FACTOR: f32 = 0.15;
pub const RECENCY_BOOST_MAX: f32 = 0.3;
pub const RECENCY_DECAY_PER_DAY: f32 = 0.01;
pub const GRAPH_BOOST: f32 = 0.2;
pub const GRAPH_HOPS: usize = 2;

/// Fusion weights when the LLM rerank succeeds.
pub const RERANK_BASE_WEIGHT: f32 = 0.7;
pub const RERANK_LLM_WEIGHT: f32 = 0.3;

const MS_PER_DAY: f64 = 86_400_000.0;

/// Options for one rerank invocation.
#[derive(Debug, Default)]
pub struct RerankOptions<'a> {
    /// Anchor document for graph proximity (usually the file open in the
    /// editor).
    pub anchor_path: Option<&'a str>,
    /// Whether the slow remote LLM rerank may run.
    pub enable_llm: bool,
    /// Rerank model id; LLM rerank is skipped when none is configured.
    pub rerank_model: Option<&'a str>,
}

/// Frequency boost: `ln(1 + open_count) * 0.15`.
fn frequency_boost(open_count: i64) -> f32 {
    ((1.0 + open_count as f64).ln() as f32) * FREQUENCY_BOOST_FACTOR
}

/// Recency boost: `max(0, 0.3 - days_since_last_open * 0.01)`; never-opened
/// documents get 0.
fn recency_boost(last_open_ts: Option<i64>, now: i64) -> f32 {
    let Some(ts) = last_open_ts else { return 0.0 };
    let days = ((now - ts).max(0) as f64 / MS_PER_DAY) as f32;
    (RECENCY_BOOST_MAX - days * RECENCY_DECAY_PER_DAY).max(0.0)
}

/// Apply the always-on boosts and stably re-sort by final score.
pub fn apply_boosts(
    items: &mut [SearchHit],
    stats: &HashMap<String, DocStats>,
    near_anchor: &HashSet<String>,
    now: i64,
) {
    for item in items.iter_mut() {
        let doc_stats = stats.get(&item.path).cloned().unwrap_or_default();
        let freq = frequency_boost(doc_stats.open_count);
        let recency = recency_boost(doc_stats.last_open_ts, now);
        let graph = if near_anchor.contains(&item.path) {
            GRAPH_BOOST
        } else {
            0.0
        };
        item.final_score = item.base_score + freq + recency + graph;
    }
    // Vec::sort_by is stable: equal scores keep their incoming order
    items.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Short human-readable annotation handed to the LLM reranker alongside
/// each document.
pub fn boost_annotation(
    path: &str,
    stats: &HashMap<String, DocStats>,
    near_anchor: &HashSet<String>,
    now: i64,
) -> String {
    let doc_stats = stats.get(path).cloned().unwrap_or_default();
    let mut parts: Vec<String> = Vec::new();
    if doc_stats.open_count > 0 {
        parts.push(format!("opened {} times", doc_stats.open_count));
    }
    if let Some(ts) = doc_stats.last_open_ts {
        let days = ((now - ts).max(0) as f64 / MS_PER_DAY).round() as i64;
        parts.push(format!("last opened {} days ago", days));
    }
    if near_anchor.contains(path) {
        parts.push("related to current file".into());
    }
    if parts.is_empty() {
        "no usage signals".into()
    } else {
        parts.join(", ")
    }
}

/// Normalize LLM rerank scores: rank-style outputs (> 1) are divided by the
/// document count, proper [0, 1] scores pass through.
fn normalize_rerank_scores(scores: &mut [(usize, f32)], doc_count: usize) {
    let rank_style = scores.iter().any(|(_, s)| *s > 1.0);
    if rank_style && doc_count > 0 {
        for (_, s) in scores.iter_mut() {
            *s /= doc_count as f32;
        }
    }
}

/// Full rerank pass: behavior + graph boosts, then (optionally) the LLM
/// reranker with weighted fusion. A failed LLM call preserves the boosted
/// ordering.
pub async fn rerank(
    pool: &DatabasePool,
    provider: Option<&dyn LlmProvider>,
    mut items: Vec<SearchHit>,
    query: &str,
    opts: RerankOptions<'_>,
) -> Result<Vec<SearchHit>> {
    if items.is_empty() {
        return Ok(items);
    }

    let paths: Vec<String> = items.iter().map(|h| h.path.clone()).collect();
    let anchor = opts.anchor_path.map(|s| s.to_string());
    let (stats, near_anchor) = pool
        .interact(move |conn| {
            let stats = stats_for_paths_sync(conn, &paths)?;
            let near = match &anchor {
                Some(anchor) => paths_within_hops_sync(conn, anchor, GRAPH_HOPS)?,
                None => HashSet::new(),
            };
            Ok((stats, near))
        })
        .await?;

    let now = now_ms();
    apply_boosts(&mut items, &stats, &near_anchor, now);

    if !opts.enable_llm {
        return Ok(items);
    }
    let (Some(provider), Some(model)) = (provider, opts.rerank_model) else {
        return Ok(items);
    };
    if !provider.supports_rerank() {
        return Ok(items);
    }
    let documents: Vec<RerankDocument> = items
        .iter()
        .enumerate()
        .map(|(index, hit)| RerankDocument {
            index,
            text: format!(
                "{} ({})",
                hit.path,
                boost_annotation(&hit.path, &stats, &near_anchor, now)
            ),
        })
        .collect();
    let doc_count = documents.len();

    match provider.rerank(query, documents, doc_count, model).await {
        Ok(scores) => {
            let mut indexed: Vec<(usize, f32)> =
                scores.into_iter().map(|s| (s.index, s.score)).collect();
            normalize_rerank_scores(&mut indexed, doc_count);
            for (index, score) in indexed {
                if let Some(item) = items.get_mut(index) {
                    item.final_score =
                        RERANK_BASE_WEIGHT * item.final_score + RERANK_LLM_WEIGHT * score;
                }
            }
            items.sort_by(|a, b| {
                b.final_score
                    .partial_cmp(&a.final_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            debug!("LLM rerank applied over {} documents", doc_count);
        }
        Err(e) => {
            warn!("LLM rerank failed, keeping boosted order: {}", e);
        }
    }
    Ok(items)
}
