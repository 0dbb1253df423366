// ── Membank Engine: Recall Pipeline ────────────────────────────────────────
// Hybrid retrieval: one query embedding, then semantic (HNSW cosine) and
// lexical (websearch tsquery) searches in parallel, fused with Reciprocal
// Rank Fusion (k = 60), assembled under a result cap and token budget with a
// created_at tie-break. Read-only: Recall never mutates state and never
// touches the consolidation worker.
//
// When RERANK_MODEL_ID is configured, a cross-encoder pass reorders the
// fused candidates before trimming; otherwise ordering is pure RRF.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{info, warn};
use pgvector::Vector;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    FactKind, FactType, RecallHit, RecallOptions, RecallResponse, ScoreBreakdown,
};
use crate::engine::embedding::embedder;
use crate::engine::reranker;
use crate::engine::timeparse;
use crate::engine::tokenizer;
use crate::engine::visibility;

pub const MAX_QUERY_LENGTH: usize = 1_000;

const RRF_K: f64 = 60.0;

const DEFAULT_MAX_RESULTS: usize = 50;
const DEFAULT_MAX_TOKENS: usize = 4_096;

/// Hits requested from each channel before fusion.
const K_SEMANTIC: i64 = 100;
const K_LEXICAL: i64 = 100;

/// Floor under which semantic hits are noise, not evidence.
const SEMANTIC_SIMILARITY_THRESHOLD: f64 = 0.1;

// ═══════════════════════════════════════════════════════════════════════════
// Channel row
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub(crate) struct ChannelHit {
    pub id: Uuid,
    pub text: String,
    pub context: Option<String>,
    pub fact_type: FactType,
    pub fact_kind: Option<FactKind>,
    pub event_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

fn row_to_hit(row: &sqlx::postgres::PgRow) -> EngineResult<ChannelHit> {
    let fact_type_str: String = row.get("fact_type");
    let fact_type = FactType::parse(&fact_type_str)
        .ok_or_else(|| EngineError::Fatal(format!("unknown fact_type in row: {fact_type_str}")))?;
    let fact_kind: Option<String> = row.get("fact_kind");
    Ok(ChannelHit {
        id: row.get("id"),
        text: row.get("text"),
        context: row.get("context"),
        fact_type,
        fact_kind: fact_kind.as_deref().and_then(FactKind::parse),
        event_date: row.get("event_date"),
        created_at: row.get("created_at"),
        tags: row.get::<Option<Vec<String>>, _>("tags").unwrap_or_default(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

/// Run the Recall pipeline. A query hitting nothing in either channel
/// returns an empty result list, not an error.
pub async fn recall(
    pool: &PgPool,
    bank_id: Uuid,
    query: &str,
    options: &RecallOptions,
) -> EngineResult<RecallResponse> {
    if query.trim().is_empty() {
        return Err(EngineError::invalid("query is required"));
    }
    if query.chars().count() > MAX_QUERY_LENGTH {
        return Err(EngineError::invalid(format!(
            "query exceeds maximum length of {MAX_QUERY_LENGTH}"
        )));
    }

    let fact_types: Vec<FactType> = options.fact_types.clone().unwrap_or_else(|| {
        vec![FactType::World, FactType::Experience, FactType::Observation]
    });
    let time_range = options.time_range.or_else(|| timeparse::extract_time_range(query));

    let query_embedding = embedder().embed_one(query).await?;

    // Both channels run concurrently.
    let (semantic, lexical) = tokio::join!(
        semantic_search(pool, bank_id, &query_embedding, &fact_types, options, time_range),
        lexical_search(pool, bank_id, query, &fact_types, options, time_range),
    );
    let semantic = semantic?;
    let lexical = lexical?;

    // Fuse, rerank (optional), assemble.
    let fused = rrf_fuse(&semantic, &lexical);
    let total_found = fused.len();

    let max_results = options.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
    let max_tokens = options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

    let ordered = apply_rerank(query, fused).await;
    let results = assemble(ordered, max_results, max_tokens);

    info!(
        "[recall] Complete for bank {}: semantic={}, lexical={}, fused={}, returned={}",
        bank_id,
        semantic.len(),
        lexical.len(),
        total_found,
        results.len()
    );

    Ok(RecallResponse { results, total_found })
}

// ═══════════════════════════════════════════════════════════════════════════
// Channel searches
// ═══════════════════════════════════════════════════════════════════════════

fn push_common_filters(
    qb: &mut QueryBuilder<'_, Postgres>,
    options: &RecallOptions,
    time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) {
    if let Some(tags) = &options.tags {
        visibility::push_tags_predicate(qb, tags, options.tags_match);
    }
    if let Some((start, end)) = time_range {
        qb.push(" AND COALESCE(event_date, occurred_start, mentioned_at, created_at) >= ");
        qb.push_bind(start);
        qb.push(" AND COALESCE(event_date, occurred_start, mentioned_at, created_at) < ");
        qb.push_bind(end);
    }
}

async fn semantic_search(
    pool: &PgPool,
    bank_id: Uuid,
    query_embedding: &[f32],
    fact_types: &[FactType],
    options: &RecallOptions,
    time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> EngineResult<Vec<ChannelHit>> {
    let type_strs: Vec<String> = fact_types.iter().map(|t| t.as_str().to_string()).collect();
    let vector = Vector::from(query_embedding.to_vec());

    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT id, text, context, fact_type, fact_kind, event_date, created_at, tags \
         FROM memory_units WHERE bank_id = ",
    );
    qb.push_bind(bank_id);
    qb.push(" AND embedding IS NOT NULL AND fact_type = ANY(");
    qb.push_bind(type_strs);
    qb.push(") AND (1 - (embedding <=> ");
    qb.push_bind(vector.clone());
    qb.push(")) >= ");
    qb.push_bind(SEMANTIC_SIMILARITY_THRESHOLD);
    push_common_filters(&mut qb, options, time_range);
    qb.push(" ORDER BY embedding <=> ");
    qb.push_bind(vector);
    qb.push(" LIMIT ");
    qb.push_bind(K_SEMANTIC);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_hit).collect()
}

async fn lexical_search(
    pool: &PgPool,
    bank_id: Uuid,
    query: &str,
    fact_types: &[FactType],
    options: &RecallOptions,
    time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> EngineResult<Vec<ChannelHit>> {
    let type_strs: Vec<String> = fact_types.iter().map(|t| t.as_str().to_string()).collect();

    // websearch_to_tsquery tolerates raw user strings; no sanitizing needed.
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT id, text, context, fact_type, fact_kind, event_date, created_at, tags, \
                ts_rank(search_vector, websearch_to_tsquery('english', ",
    );
    qb.push_bind(query);
    qb.push(")) AS rank FROM memory_units WHERE bank_id = ");
    qb.push_bind(bank_id);
    qb.push(" AND fact_type = ANY(");
    qb.push_bind(type_strs);
    qb.push(") AND search_vector @@ websearch_to_tsquery('english', ");
    qb.push_bind(query);
    qb.push(")");
    push_common_filters(&mut qb, options, time_range);
    qb.push(" ORDER BY rank DESC LIMIT ");
    qb.push_bind(K_LEXICAL);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_hit).collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Fusion
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub(crate) struct FusedHit {
    pub hit: ChannelHit,
    pub rrf: f64,
    pub semantic_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
    pub rerank: Option<f64>,
}

/// Reciprocal Rank Fusion: each channel contributes 1/(k + rank) with
/// 1-based ranks; contributions sum per unit.
pub(crate) fn rrf_fuse(semantic: &[ChannelHit], lexical: &[ChannelHit]) -> Vec<FusedHit> {
    let mut fused: HashMap<Uuid, FusedHit> = HashMap::new();

    for (index, hit) in semantic.iter().enumerate() {
        let rank = index + 1;
        let entry = fused.entry(hit.id).or_insert_with(|| FusedHit {
            hit: hit.clone(),
            rrf: 0.0,
            semantic_rank: None,
            lexical_rank: None,
            rerank: None,
        });
        entry.rrf += 1.0 / (RRF_K + rank as f64);
        entry.semantic_rank = Some(rank);
    }

    for (index, hit) in lexical.iter().enumerate() {
        let rank = index + 1;
        let entry = fused.entry(hit.id).or_insert_with(|| FusedHit {
            hit: hit.clone(),
            rrf: 0.0,
            semantic_rank: None,
            lexical_rank: None,
            rerank: None,
        });
        entry.rrf += 1.0 / (RRF_K + rank as f64);
        entry.lexical_rank = Some(rank);
    }

    fused.into_values().collect()
}

/// Sort candidates: rerank relevance when present, fused score otherwise,
/// with more recent created_at breaking ties deterministically.
pub(crate) fn sort_candidates(mut candidates: Vec<FusedHit>) -> Vec<FusedHit> {
    candidates.sort_by(|a, b| {
        let a_key = a.rerank.unwrap_or(a.rrf);
        let b_key = b.rerank.unwrap_or(b.rrf);
        b_key
            .partial_cmp(&a_key)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.hit.created_at.cmp(&a.hit.created_at))
            .then_with(|| a.hit.id.cmp(&b.hit.id))
    });
    candidates
}

/// Optional cross-encoder pass. Disabled (the default) leaves pure RRF
/// ordering; a rerank failure falls back to RRF rather than failing recall.
async fn apply_rerank(query: &str, fused: Vec<FusedHit>) -> Vec<FusedHit> {
    let mut candidates = sort_candidates(fused);

    if !reranker::enabled() || candidates.is_empty() {
        return candidates;
    }

    let documents: Vec<String> = candidates
        .iter()
        .take(reranker::RERANK_CANDIDATE_LIMIT)
        .map(|c| reranker::build_rerank_document(&c.hit.text, c.hit.context.as_deref(), c.hit.event_date))
        .collect();

    match reranker::rerank(query, &documents).await {
        Ok(scores) => {
            for (index, score) in scores {
                if let Some(candidate) = candidates.get_mut(index) {
                    candidate.rerank = Some(score);
                }
            }
            sort_candidates(candidates)
        }
        Err(e) => {
            warn!("[recall] Rerank failed, falling back to RRF order: {e}");
            candidates
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Assembly
// ═══════════════════════════════════════════════════════════════════════════

/// Take ordered candidates until the result cap or token budget is reached,
/// whichever comes first. The first hit always fits so a single oversized
/// unit cannot yield an empty response.
pub(crate) fn assemble(
    ordered: Vec<FusedHit>,
    max_results: usize,
    max_tokens: usize,
) -> Vec<RecallHit> {
    let mut results = Vec::new();
    let mut spent_tokens = 0usize;

    for candidate in ordered.into_iter().take(max_results) {
        let cost = tokenizer::unit_cost(&candidate.hit.text, candidate.hit.context.as_deref());
        if spent_tokens + cost > max_tokens && !results.is_empty() {
            break;
        }
        spent_tokens += cost;

        let score = candidate.rerank.unwrap_or(candidate.rrf);
        results.push(RecallHit {
            id: candidate.hit.id,
            text: candidate.hit.text,
            context: candidate.hit.context,
            fact_type: candidate.hit.fact_type,
            fact_kind: candidate.hit.fact_kind,
            event_date: candidate.hit.event_date,
            created_at: candidate.hit.created_at,
            tags: candidate.hit.tags,
            score,
            breakdown: ScoreBreakdown {
                semantic_rank: candidate.semantic_rank,
                lexical_rank: candidate.lexical_rank,
                rrf: candidate.rrf,
                rerank: candidate.rerank,
            },
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hit(id_byte: u8, created_minute: u32) -> ChannelHit {
        ChannelHit {
            id: Uuid::from_bytes([id_byte; 16]),
            text: format!("unit {id_byte}"),
            context: None,
            fact_type: FactType::World,
            fact_kind: Some(FactKind::Event),
            event_date: None,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, created_minute, 0).unwrap(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_rrf_sums_across_channels() {
        let a = hit(1, 0);
        let b = hit(2, 1);
        let c = hit(3, 2);
        // a: rank 1 semantic + rank 2 lexical; b: rank 2 semantic;
        // c: rank 1 lexical.
        let fused = rrf_fuse(&[a.clone(), b.clone()], &[c.clone(), a.clone()]);
        let by_id: HashMap<Uuid, &FusedHit> = fused.iter().map(|f| (f.hit.id, f)).collect();

        let fa = by_id[&a.id];
        assert_eq!(fa.semantic_rank, Some(1));
        assert_eq!(fa.lexical_rank, Some(2));
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fa.rrf - expected).abs() < 1e-12);

        assert_eq!(by_id[&b.id].semantic_rank, Some(2));
        assert_eq!(by_id[&b.id].lexical_rank, None);
        assert_eq!(by_id[&c.id].lexical_rank, Some(1));
    }

    #[test]
    fn test_dual_channel_hit_outranks_single() {
        let a = hit(1, 0);
        let b = hit(2, 0);
        let fused = rrf_fuse(&[a.clone(), b.clone()], &[a.clone()]);
        let ordered = sort_candidates(fused);
        assert_eq!(ordered[0].hit.id, a.id);
    }

    #[test]
    fn test_tie_break_prefers_more_recent() {
        let older = hit(1, 0);
        let newer = hit(2, 30);
        // Same single-channel rank structure: equal RRF scores.
        let fused_a = rrf_fuse(&[older.clone()], &[]);
        let fused_b = rrf_fuse(&[newer.clone()], &[]);
        let mut all = fused_a;
        all.extend(fused_b);
        let ordered = sort_candidates(all);
        assert_eq!(ordered[0].hit.id, newer.id);
    }

    #[test]
    fn test_assemble_respects_max_results() {
        let candidates: Vec<FusedHit> =
            sort_candidates(rrf_fuse(&(1..=10).map(|i| hit(i, 0)).collect::<Vec<_>>(), &[]));
        let results = assemble(candidates, 3, usize::MAX);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_assemble_respects_token_budget() {
        let mut long = hit(1, 0);
        long.text = "x".repeat(700); // ~200 tokens
        let mut second = hit(2, 0);
        second.text = "y".repeat(700);
        let ordered = sort_candidates(rrf_fuse(&[long, second], &[]));
        let results = assemble(ordered, 10, 250);
        assert_eq!(results.len(), 1, "budget should cut after the first unit");
    }

    #[test]
    fn test_assemble_never_empty_when_first_unit_oversized() {
        let mut big = hit(1, 0);
        big.text = "z".repeat(10_000);
        let ordered = sort_candidates(rrf_fuse(&[big], &[]));
        let results = assemble(ordered, 10, 1);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_assemble_attaches_breakdown() {
        let a = hit(1, 0);
        let ordered = sort_candidates(rrf_fuse(&[a.clone()], &[a.clone()]));
        let results = assemble(ordered, 10, usize::MAX);
        let b = &results[0].breakdown;
        assert_eq!(b.semantic_rank, Some(1));
        assert_eq!(b.lexical_rank, Some(1));
        assert!(b.rrf > 0.0);
        assert!(b.rerank.is_none());
        assert!((results[0].score - b.rrf).abs() < 1e-12);
    }

    #[test]
    fn test_empty_channels_fuse_to_nothing() {
        assert!(rrf_fuse(&[], &[]).is_empty());
        assert!(assemble(Vec::new(), 10, 100).is_empty());
    }
}
