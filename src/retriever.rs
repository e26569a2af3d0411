//! Hybrid retriever: turns planned sub-queries into a token-budgeted
//! evidence set.
//!
//! For each sub-query the dense and sparse channels are dispatched
//! concurrently and their candidates unioned (deduplicated by chunk id).
//! Channel scores are min-max normalized and fused with equal weight;
//! ties break on raw dense score, then raw sparse score, then insertion
//! order, so results are fully deterministic. The fused pool is truncated
//! to `rerank_pool`, optionally reshaped by the `raptor` or `graph`
//! strategy, reranked by query-term overlap, truncated to `top_n`, and
//! finally accumulated against the coverage budget.
//!
//! An empty store or zero matches yields an empty evidence set — that is
//! a degraded answer downstream, not an error. Store failures propagate.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::chunk::estimate_tokens;
use crate::models::{Chunk, ScoredChunk, SubQueryReport};
use crate::planner::Plan;
use crate::settings::RetrievalConfig;
use crate::store::ChunkStore;

/// Everything the retrieval step produces and reports.
#[derive(Debug)]
pub struct Retrieval {
    /// Final evidence, highest relevance first. Never longer than `top_n`,
    /// never more than `max_context_tokens` estimated tokens.
    pub evidence: Vec<ScoredChunk>,
    pub sub_query_reports: Vec<SubQueryReport>,
    /// Candidate count after dedup and pool truncation.
    pub total_chunks: usize,
    /// Distinct source documents among the candidates.
    pub unique_sources: usize,
    pub strategy: &'static str,
    /// Estimated tokens in the selected evidence.
    pub context_tokens: usize,
    /// Achieved fraction of `max_context_tokens`.
    pub coverage: f64,
}

/// One deduplicated candidate accumulated across sub-queries.
struct Candidate {
    chunk_id: String,
    dense: Option<f64>,
    sparse: Option<f64>,
    /// Order of first appearance, the final tie-break.
    insertion: usize,
    /// Which sub-queries returned this chunk (for graph expansion).
    hit_by: HashSet<usize>,
    fused: f64,
}

/// Run the retrieval stage for a plan.
pub async fn retrieve(
    store: &dyn ChunkStore,
    plan: &Plan,
    cfg: &RetrievalConfig,
) -> Result<Retrieval> {
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut reports: Vec<SubQueryReport> = Vec::with_capacity(plan.sub_queries.len());

    for (qi, query) in plan.sub_queries.iter().enumerate() {
        let started = Instant::now();

        // The two channels are independent; join them before fusion.
        let (dense, sparse) = tokio::join!(
            store.dense_search(query, cfg.dense_k),
            async {
                if cfg.hybrid {
                    store.sparse_search(query, cfg.sparse_k).await
                } else {
                    Ok(Vec::new())
                }
            }
        );
        let dense = dense?;
        let sparse = sparse?;

        let mut found: HashSet<&str> = HashSet::new();
        for hit in &dense {
            found.insert(hit.chunk_id.as_str());
            let slot = entry(&mut candidates, &mut index, &hit.chunk_id);
            let c = &mut candidates[slot];
            c.dense = Some(c.dense.map_or(hit.score, |s| s.max(hit.score)));
            c.hit_by.insert(qi);
        }
        for hit in &sparse {
            found.insert(hit.chunk_id.as_str());
            let slot = entry(&mut candidates, &mut index, &hit.chunk_id);
            let c = &mut candidates[slot];
            c.sparse = Some(c.sparse.map_or(hit.score, |s| s.max(hit.score)));
            c.hit_by.insert(qi);
        }

        reports.push(SubQueryReport {
            query: query.clone(),
            chunks_found: found.len(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
    }

    fuse(&mut candidates);
    sort_fused(&mut candidates);
    candidates.truncate(cfg.rerank_pool);

    // Alternate selection strategies reshape the candidate pool behind
    // the same output contract.
    let strategy: &'static str = if cfg.raptor_enabled() {
        "raptor"
    } else if cfg.graph {
        "graph"
    } else {
        "flat"
    };

    let mut pool = fetch_chunks(store, &candidates).await?;
    match strategy {
        "raptor" => pool = raptor_order(pool),
        "graph" => pool = graph_order(pool, &candidates, plan.sub_queries.len()),
        _ => {}
    }

    let total_chunks = pool.len();
    let unique_sources = pool
        .iter()
        .map(|(c, _)| c.document_id.as_str())
        .collect::<HashSet<_>>()
        .len();

    // Rerank: blend the fused retrieval score with query-term overlap.
    let query_terms = collect_terms(&plan.sub_queries);
    let mut reranked: Vec<(Chunk, f64)> = pool
        .into_iter()
        .map(|(chunk, fused)| {
            let overlap = term_overlap(&query_terms, &chunk.text);
            (chunk, 0.5 * fused + 0.5 * overlap)
        })
        .collect();
    reranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    reranked.truncate(cfg.top_n);

    if cfg.compression {
        let per_chunk_budget = plan.target_tokens / cfg.top_n.max(1);
        for (chunk, _) in &mut reranked {
            chunk.text = compress(&chunk.text, per_chunk_budget);
        }
    }

    // Coverage-driven selection: fill until the plan's coverage share of
    // the context budget is reached, never exceeding the hard cap.
    let budget = (plan.coverage_target * cfg.max_context_tokens as f64) as usize;
    let mut evidence: Vec<ScoredChunk> = Vec::new();
    let mut used_tokens = 0usize;
    for (chunk, score) in reranked {
        let tokens = estimate_tokens(&chunk.text);
        if used_tokens + tokens > cfg.max_context_tokens {
            break;
        }
        used_tokens += tokens;
        evidence.push(ScoredChunk {
            id: chunk.id,
            document_id: chunk.document_id,
            title: chunk.title,
            text: chunk.text,
            score,
        });
        if used_tokens >= budget {
            break;
        }
    }

    let coverage = if cfg.max_context_tokens > 0 {
        (used_tokens as f64 / cfg.max_context_tokens as f64).min(1.0)
    } else {
        0.0
    };

    Ok(Retrieval {
        evidence,
        sub_query_reports: reports,
        total_chunks,
        unique_sources,
        strategy,
        context_tokens: used_tokens,
        coverage,
    })
}

fn entry<'a>(
    candidates: &'a mut Vec<Candidate>,
    index: &mut HashMap<String, usize>,
    chunk_id: &str,
) -> usize {
    if let Some(&slot) = index.get(chunk_id) {
        return slot;
    }
    let slot = candidates.len();
    candidates.push(Candidate {
        chunk_id: chunk_id.to_string(),
        dense: None,
        sparse: None,
        insertion: slot,
        hit_by: HashSet::new(),
        fused: 0.0,
    });
    index.insert(chunk_id.to_string(), slot);
    slot
}

/// Min-max normalize each channel to [0, 1] and fuse with equal weight.
/// A chunk absent from a channel contributes 0 for it.
fn fuse(candidates: &mut [Candidate]) {
    let dense_norm = channel_bounds(candidates.iter().filter_map(|c| c.dense));
    let sparse_norm = channel_bounds(candidates.iter().filter_map(|c| c.sparse));

    for c in candidates.iter_mut() {
        let d = c.dense.map(|s| dense_norm.normalize(s)).unwrap_or(0.0);
        let s = c.sparse.map(|s| sparse_norm.normalize(s)).unwrap_or(0.0);
        c.fused = 0.5 * d + 0.5 * s;
    }
}

struct Bounds {
    min: f64,
    max: f64,
}

impl Bounds {
    fn normalize(&self, score: f64) -> f64 {
        if (self.max - self.min).abs() < f64::EPSILON {
            1.0
        } else {
            (score - self.min) / (self.max - self.min)
        }
    }
}

fn channel_bounds(scores: impl Iterator<Item = f64>) -> Bounds {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for s in scores {
        min = min.min(s);
        max = max.max(s);
    }
    Bounds { min, max }
}

/// Fused score descending; ties break on raw dense, raw sparse, then
/// first-seen order.
fn sort_fused(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.dense
                    .unwrap_or(f64::NEG_INFINITY)
                    .partial_cmp(&a.dense.unwrap_or(f64::NEG_INFINITY))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                b.sparse
                    .unwrap_or(f64::NEG_INFINITY)
                    .partial_cmp(&a.sparse.unwrap_or(f64::NEG_INFINITY))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.insertion.cmp(&b.insertion))
    });
}

/// Resolve candidate ids to chunks, dropping ids the store no longer has
/// (a document may have been deleted since the lookup).
async fn fetch_chunks(
    store: &dyn ChunkStore,
    candidates: &[Candidate],
) -> Result<Vec<(Chunk, f64)>> {
    let mut out = Vec::with_capacity(candidates.len());
    for cand in candidates {
        if let Some(chunk) = store.get(&cand.chunk_id).await? {
            out.push((chunk, cand.fused));
        }
    }
    Ok(out)
}

/// RAPTOR-style hierarchical selection: rank source documents by their
/// best chunk (MAX aggregation), then emit each document's chunks in
/// score order, best document first.
fn raptor_order(pool: Vec<(Chunk, f64)>) -> Vec<(Chunk, f64)> {
    let mut doc_best: HashMap<String, f64> = HashMap::new();
    for (chunk, score) in &pool {
        let best = doc_best.entry(chunk.document_id.clone()).or_insert(*score);
        if *score > *best {
            *best = *score;
        }
    }

    let mut ordered = pool;
    ordered.sort_by(|a, b| {
        let da = doc_best[&a.0.document_id];
        let db = doc_best[&b.0.document_id];
        db.partial_cmp(&da)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.document_id.cmp(&b.0.document_id))
            .then_with(|| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.0.chunk_index.cmp(&b.0.chunk_index))
    });
    ordered
}

/// Co-retrieval graph selection: chunks are linked when more than one
/// sub-query returned them or when they are adjacent chunks of the same
/// document. Seeds (multi-hit chunks) come first, then their neighbors,
/// then the rest, each tier in fused order.
fn graph_order(
    pool: Vec<(Chunk, f64)>,
    candidates: &[Candidate],
    sub_query_count: usize,
) -> Vec<(Chunk, f64)> {
    if sub_query_count <= 1 {
        return pool;
    }

    let hits: HashMap<&str, usize> = candidates
        .iter()
        .map(|c| (c.chunk_id.as_str(), c.hit_by.len()))
        .collect();

    let seed_docs: HashSet<String> = pool
        .iter()
        .filter(|(c, _)| hits.get(c.id.as_str()).copied().unwrap_or(0) > 1)
        .map(|(c, _)| c.document_id.clone())
        .collect();

    let tier = |chunk: &Chunk| -> u8 {
        if hits.get(chunk.id.as_str()).copied().unwrap_or(0) > 1 {
            0 // seed: co-retrieved by multiple sub-queries
        } else if seed_docs.contains(&chunk.document_id) {
            1 // neighbor: same document as a seed
        } else {
            2
        }
    };

    let mut ordered = pool;
    ordered.sort_by(|a, b| {
        tier(&a.0)
            .cmp(&tier(&b.0))
            .then_with(|| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    ordered
}

// ============ Rerank scoring ============

fn collect_terms(queries: &[String]) -> HashSet<String> {
    queries
        .iter()
        .flat_map(|q| q.split(|c: char| !c.is_alphanumeric()))
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of distinct query terms present in the chunk text.
fn term_overlap(query_terms: &HashSet<String>, text: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_lower = text.to_lowercase();
    let text_terms: HashSet<&str> = text_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .collect();
    let matched = query_terms
        .iter()
        .filter(|t| text_terms.contains(t.as_str()))
        .count();
    matched as f64 / query_terms.len() as f64
}

// ============ Compression ============

/// Lossy head-truncation at the last paragraph or sentence boundary that
/// fits the per-chunk token budget.
fn compress(text: &str, budget_tokens: usize) -> String {
    let budget_chars = budget_tokens * crate::chunk::CHARS_PER_TOKEN;
    if text.len() <= budget_chars || budget_chars == 0 {
        return text.to_string();
    }
    let window = &text[..crate::chunk::floor_char_boundary(text, budget_chars)];
    let cut = window
        .rfind("\n\n")
        .or_else(|| window.rfind(". ").map(|p| p + 1))
        .unwrap_or(window.len());
    text[..cut].trim_end().to_string()
}
