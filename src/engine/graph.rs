// ── Membank Engine: Link Graph Maintenance ─────────────────────────────────
// Builds the multi-typed edge graph over memory units:
//
//   temporal — events within a 24-hour window, weight decaying with gap
//   semantic — cosine similarity >= 0.7 neighbors
//   entity   — units sharing an entity, weight 1.0, provenance on the edge
//
// Called from Retain after its transaction commits (failures never unwind
// stored facts) and from consolidation to chain consecutive observations
// about the same entity. causes/caused_by edges are reserved for a future
// causal extraction pass.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use log::info;
use pgvector::Vector;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::atoms::error::EngineResult;
use crate::atoms::types::LinkType;

// ── Tunables ───────────────────────────────────────────────────────────────

const TEMPORAL_WINDOW_HOURS: f64 = 24.0;
const TEMPORAL_WEIGHT_MIN: f64 = 0.3;
const MAX_TEMPORAL_LINKS_PER_UNIT: usize = 10;
const MAX_TEMPORAL_CANDIDATES: i64 = 200;

const SEMANTIC_TOP_K: i64 = 5;
const SEMANTIC_THRESHOLD: f64 = 0.7;

const MAX_LINKS_PER_ENTITY: usize = 50;

/// Observation chains decay on this timescale; a month apart ≈ 1/e weight.
const OBSERVATION_CHAIN_DECAY_DAYS: f64 = 30.0;
const OBSERVATION_CHAIN_WEIGHT_MIN: f64 = 0.1;

// ── Link record ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LinkRecord {
    from_unit_id: Uuid,
    to_unit_id: Uuid,
    link_type: LinkType,
    weight: f64,
    entity_id: Option<Uuid>,
}

impl LinkRecord {
    fn pair(a: Uuid, b: Uuid, link_type: LinkType, weight: f64, entity_id: Option<Uuid>) -> [LinkRecord; 2] {
        [
            LinkRecord { from_unit_id: a, to_unit_id: b, link_type, weight, entity_id },
            LinkRecord { from_unit_id: b, to_unit_id: a, link_type, weight, entity_id },
        ]
    }
}

#[derive(Debug, Default)]
pub struct LinkStats {
    pub temporal: usize,
    pub semantic: usize,
    pub entity: usize,
    pub cooccurrences: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

/// Build graph edges for freshly stored units. Runs outside the Retain
/// transaction.
pub async fn build_links_for_units(
    pool: &PgPool,
    bank_id: Uuid,
    unit_ids: &[Uuid],
    embeddings: &[Vec<f32>],
) -> EngineResult<LinkStats> {
    if unit_ids.is_empty() {
        return Ok(LinkStats::default());
    }

    let mut conn = pool.acquire().await?;

    let temporal = build_temporal_links(&mut conn, bank_id, unit_ids).await?;
    let semantic = build_semantic_links(&mut conn, bank_id, unit_ids, embeddings).await?;
    let entity = build_entity_links(&mut conn, bank_id, unit_ids).await?;

    let stats = LinkStats {
        temporal: temporal.len(),
        semantic: semantic.len(),
        entity: entity.len(),
        cooccurrences: 0,
    };

    let mut all_links = temporal;
    all_links.extend(semantic);
    all_links.extend(entity);
    insert_links(&mut conn, bank_id, &all_links).await?;

    let cooccurrences = update_entity_cooccurrences(&mut conn, bank_id, unit_ids).await?;

    info!(
        "[graph] Links built for {} units: temporal={}, semantic={}, entity={}, cooccurrences={}",
        unit_ids.len(),
        stats.temporal,
        stats.semantic,
        stats.entity,
        cooccurrences
    );

    Ok(LinkStats { cooccurrences, ..stats })
}

/// Chain consecutive observations about each entity with temporal edges
/// whose weight decays with the gap between them. Called after a
/// consolidation batch with the entities its observations touch.
pub async fn link_consecutive_observations(
    pool: &PgPool,
    bank_id: Uuid,
    entity_ids: &[Uuid],
) -> EngineResult<usize> {
    if entity_ids.is_empty() {
        return Ok(0);
    }

    let mut conn = pool.acquire().await?;
    let mut links: Vec<LinkRecord> = Vec::new();

    for &entity_id in entity_ids {
        let rows = sqlx::query(
            "SELECT mu.id, COALESCE(mu.occurred_start, mu.mentioned_at, mu.created_at) AS at
             FROM unit_entities ue
             JOIN memory_units mu ON ue.unit_id = mu.id
             WHERE ue.entity_id = $1
               AND mu.bank_id = $2
               AND mu.fact_type = 'observation'
             ORDER BY at ASC",
        )
        .bind(entity_id)
        .bind(bank_id)
        .fetch_all(&mut *conn)
        .await?;

        let timeline: Vec<(Uuid, DateTime<Utc>)> =
            rows.iter().map(|r| (r.get("id"), r.get("at"))).collect();

        for window in timeline.windows(2) {
            let (earlier_id, earlier_at) = window[0];
            let (later_id, later_at) = window[1];
            let gap_days = (later_at - earlier_at).num_seconds().max(0) as f64 / 86_400.0;
            let weight = observation_chain_weight(gap_days);
            links.extend(LinkRecord::pair(
                earlier_id,
                later_id,
                LinkType::Temporal,
                weight,
                Some(entity_id),
            ));
        }
    }

    insert_links(&mut conn, bank_id, &links).await?;
    Ok(links.len())
}

// ═══════════════════════════════════════════════════════════════════════════
// Weights & similarity
// ═══════════════════════════════════════════════════════════════════════════

/// Temporal edge weight within the 24-hour window, floored at 0.3.
fn temporal_weight(gap_hours: f64) -> f64 {
    (1.0 - gap_hours / TEMPORAL_WINDOW_HOURS).max(TEMPORAL_WEIGHT_MIN)
}

/// Decaying weight for observation chains; far-apart observations stay
/// linked but faintly.
fn observation_chain_weight(gap_days: f64) -> f64 {
    (-gap_days / OBSERVATION_CHAIN_DECAY_DAYS)
        .exp()
        .max(OBSERVATION_CHAIN_WEIGHT_MIN)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ═══════════════════════════════════════════════════════════════════════════
// Temporal links
// ═══════════════════════════════════════════════════════════════════════════

async fn fetch_unit_times(
    conn: &mut PgConnection,
    unit_ids: &[Uuid],
) -> EngineResult<HashMap<Uuid, DateTime<Utc>>> {
    let rows = sqlx::query(
        "SELECT id, COALESCE(event_date, occurred_start, mentioned_at) AS at
         FROM memory_units
         WHERE id = ANY($1)",
    )
    .bind(unit_ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut times = HashMap::new();
    for row in rows {
        if let Some(at) = row.get::<Option<DateTime<Utc>>, _>("at") {
            times.insert(row.get::<Uuid, _>("id"), at);
        }
    }
    Ok(times)
}

async fn build_temporal_links(
    conn: &mut PgConnection,
    bank_id: Uuid,
    unit_ids: &[Uuid],
) -> EngineResult<Vec<LinkRecord>> {
    let unit_times = fetch_unit_times(conn, unit_ids).await?;
    if unit_times.is_empty() {
        return Ok(Vec::new());
    }

    let window = Duration::hours(TEMPORAL_WINDOW_HOURS as i64);
    let min_date = *unit_times.values().min().unwrap() - window;
    let max_date = *unit_times.values().max().unwrap() + window;

    let candidates = sqlx::query(
        "SELECT id, COALESCE(event_date, occurred_start, mentioned_at) AS at
         FROM memory_units
         WHERE bank_id = $1
           AND id != ALL($2)
           AND COALESCE(event_date, occurred_start, mentioned_at) BETWEEN $3 AND $4
         ORDER BY COALESCE(event_date, occurred_start, mentioned_at) DESC
         LIMIT $5",
    )
    .bind(bank_id)
    .bind(unit_ids)
    .bind(min_date)
    .bind(max_date)
    .bind(MAX_TEMPORAL_CANDIDATES)
    .fetch_all(&mut *conn)
    .await?;

    let mut links = Vec::new();

    // New ↔ existing.
    for (&uid, &unit_at) in &unit_times {
        let mut matched = 0usize;
        for candidate in &candidates {
            let Some(candidate_at) = candidate.get::<Option<DateTime<Utc>>, _>("at") else {
                continue;
            };
            let gap_hours = (unit_at - candidate_at).num_seconds().abs() as f64 / 3_600.0;
            if gap_hours > TEMPORAL_WINDOW_HOURS {
                continue;
            }
            links.extend(LinkRecord::pair(
                uid,
                candidate.get("id"),
                LinkType::Temporal,
                temporal_weight(gap_hours),
                None,
            ));
            matched += 1;
            if matched >= MAX_TEMPORAL_LINKS_PER_UNIT {
                break;
            }
        }
    }

    // New ↔ new within the batch.
    let entries: Vec<(Uuid, DateTime<Utc>)> = unit_times.into_iter().collect();
    for (i, &(id_a, at_a)) in entries.iter().enumerate() {
        for &(id_b, at_b) in &entries[i + 1..] {
            let gap_hours = (at_a - at_b).num_seconds().abs() as f64 / 3_600.0;
            if gap_hours > TEMPORAL_WINDOW_HOURS {
                continue;
            }
            links.extend(LinkRecord::pair(
                id_a,
                id_b,
                LinkType::Temporal,
                temporal_weight(gap_hours),
                None,
            ));
        }
    }

    Ok(links)
}

// ═══════════════════════════════════════════════════════════════════════════
// Semantic links
// ═══════════════════════════════════════════════════════════════════════════

async fn build_semantic_links(
    conn: &mut PgConnection,
    bank_id: Uuid,
    unit_ids: &[Uuid],
    embeddings: &[Vec<f32>],
) -> EngineResult<Vec<LinkRecord>> {
    let mut links = Vec::new();

    // New ↔ existing via the HNSW index.
    for (uid, embedding) in unit_ids.iter().zip(embeddings) {
        let rows = sqlx::query(
            "SELECT id, 1 - (embedding <=> $1) AS similarity
             FROM memory_units
             WHERE bank_id = $2
               AND embedding IS NOT NULL
               AND id != $3
               AND (1 - (embedding <=> $1)) >= $4
             ORDER BY embedding <=> $1
             LIMIT $5",
        )
        .bind(Vector::from(embedding.clone()))
        .bind(bank_id)
        .bind(uid)
        .bind(SEMANTIC_THRESHOLD)
        .bind(SEMANTIC_TOP_K)
        .fetch_all(&mut *conn)
        .await?;

        for row in rows {
            let similarity: f64 = row.get("similarity");
            links.extend(LinkRecord::pair(
                *uid,
                row.get("id"),
                LinkType::Semantic,
                similarity.clamp(0.0, 1.0),
                None,
            ));
        }
    }

    // New ↔ new, computed locally.
    for i in 0..unit_ids.len() {
        for j in i + 1..unit_ids.len() {
            let similarity = cosine_similarity(&embeddings[i], &embeddings[j]);
            if similarity >= SEMANTIC_THRESHOLD {
                links.extend(LinkRecord::pair(
                    unit_ids[i],
                    unit_ids[j],
                    LinkType::Semantic,
                    similarity.clamp(0.0, 1.0),
                    None,
                ));
            }
        }
    }

    Ok(links)
}

// ═══════════════════════════════════════════════════════════════════════════
// Entity links
// ═══════════════════════════════════════════════════════════════════════════

async fn build_entity_links(
    conn: &mut PgConnection,
    bank_id: Uuid,
    unit_ids: &[Uuid],
) -> EngineResult<Vec<LinkRecord>> {
    let rows = sqlx::query(
        "SELECT unit_id, entity_id FROM unit_entities WHERE unit_id = ANY($1)",
    )
    .bind(unit_ids)
    .fetch_all(&mut *conn)
    .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut entity_to_new_units: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for row in &rows {
        entity_to_new_units
            .entry(row.get("entity_id"))
            .or_default()
            .push(row.get("unit_id"));
    }

    let entity_ids: Vec<Uuid> = entity_to_new_units.keys().copied().collect();
    // Newest existing units first so the per-entity cap keeps recent context.
    let existing_rows = sqlx::query(
        "SELECT ue.entity_id, ue.unit_id
         FROM unit_entities ue
         JOIN memory_units mu ON ue.unit_id = mu.id
         WHERE ue.entity_id = ANY($1)
           AND ue.unit_id != ALL($2)
           AND mu.bank_id = $3
         ORDER BY mu.created_at DESC",
    )
    .bind(&entity_ids)
    .bind(unit_ids)
    .bind(bank_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut entity_to_existing: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for row in &existing_rows {
        entity_to_existing
            .entry(row.get("entity_id"))
            .or_default()
            .push(row.get("unit_id"));
    }

    let mut links = Vec::new();
    for (entity_id, new_units) in &entity_to_new_units {
        let existing = entity_to_existing.get(entity_id).map(Vec::as_slice).unwrap_or(&[]);

        for &new_unit in new_units {
            for &existing_unit in existing.iter().take(MAX_LINKS_PER_ENTITY) {
                links.extend(LinkRecord::pair(
                    new_unit,
                    existing_unit,
                    LinkType::Entity,
                    1.0,
                    Some(*entity_id),
                ));
            }
        }

        for (i, &unit_a) in new_units.iter().enumerate() {
            for &unit_b in &new_units[i + 1..] {
                links.extend(LinkRecord::pair(unit_a, unit_b, LinkType::Entity, 1.0, Some(*entity_id)));
            }
        }
    }

    Ok(links)
}

// ═══════════════════════════════════════════════════════════════════════════
// Co-occurrence counters
// ═══════════════════════════════════════════════════════════════════════════

/// Canonicalize an entity pair as (smaller, larger).
fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a < b { (a, b) } else { (b, a) }
}

/// Count joint appearances of entity pairs within the given units.
pub async fn update_entity_cooccurrences(
    conn: &mut PgConnection,
    bank_id: Uuid,
    unit_ids: &[Uuid],
) -> EngineResult<usize> {
    let rows = sqlx::query(
        "SELECT unit_id, array_agg(entity_id ORDER BY entity_id) AS entity_ids
         FROM unit_entities
         WHERE unit_id = ANY($1)
         GROUP BY unit_id
         HAVING COUNT(*) >= 2",
    )
    .bind(unit_ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut pairs: HashSet<(Uuid, Uuid)> = HashSet::new();
    for row in &rows {
        let entity_ids: Vec<Uuid> = row.get("entity_ids");
        for (i, &a) in entity_ids.iter().enumerate() {
            for &b in &entity_ids[i + 1..] {
                if a != b {
                    pairs.insert(canonical_pair(a, b));
                }
            }
        }
    }

    for (a, b) in &pairs {
        sqlx::query(
            "INSERT INTO entity_cooccurrences
                 (entity_id_1, entity_id_2, bank_id, cooccurrence_count, last_cooccurred)
             VALUES ($1, $2, $3, 1, NOW())
             ON CONFLICT (entity_id_1, entity_id_2) DO UPDATE SET
                 cooccurrence_count = entity_cooccurrences.cooccurrence_count + 1,
                 last_cooccurred = NOW()",
        )
        .bind(a)
        .bind(b)
        .bind(bank_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(pairs.len())
}

// ═══════════════════════════════════════════════════════════════════════════
// Batch insert
// ═══════════════════════════════════════════════════════════════════════════

async fn insert_links(
    conn: &mut PgConnection,
    bank_id: Uuid,
    links: &[LinkRecord],
) -> EngineResult<()> {
    if links.is_empty() {
        return Ok(());
    }

    let from_ids: Vec<Uuid> = links.iter().map(|l| l.from_unit_id).collect();
    let to_ids: Vec<Uuid> = links.iter().map(|l| l.to_unit_id).collect();
    let types: Vec<String> = links.iter().map(|l| l.link_type.as_str().to_string()).collect();
    let weights: Vec<f32> = links.iter().map(|l| l.weight as f32).collect();
    let entity_ids: Vec<Option<Uuid>> = links.iter().map(|l| l.entity_id).collect();

    sqlx::query(
        "INSERT INTO memory_links (bank_id, from_unit_id, to_unit_id, link_type, weight, entity_id)
         SELECT $1, f, t, lt, w, e
         FROM UNNEST($2::uuid[], $3::uuid[], $4::text[], $5::real[], $6::uuid[])
              AS links(f, t, lt, w, e)
         ON CONFLICT DO NOTHING",
    )
    .bind(bank_id)
    .bind(&from_ids)
    .bind(&to_ids)
    .bind(&types)
    .bind(&weights)
    .bind(&entity_ids)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporal_weight_decays_with_floor() {
        assert!((temporal_weight(0.0) - 1.0).abs() < 1e-9);
        assert!((temporal_weight(12.0) - 0.5).abs() < 1e-9);
        assert!((temporal_weight(24.0) - TEMPORAL_WEIGHT_MIN).abs() < 1e-9);
        assert!((temporal_weight(100.0) - TEMPORAL_WEIGHT_MIN).abs() < 1e-9);
    }

    #[test]
    fn test_observation_chain_weight() {
        assert!((observation_chain_weight(0.0) - 1.0).abs() < 1e-9);
        let month = observation_chain_weight(OBSERVATION_CHAIN_DECAY_DAYS);
        assert!((month - (-1.0f64).exp()).abs() < 1e-9);
        assert!((observation_chain_weight(10_000.0) - OBSERVATION_CHAIN_WEIGHT_MIN).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0f32, 0.0, 0.0];
        let b = vec![1.0f32, 0.0, 0.0];
        let c = vec![0.0f32, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_canonical_pair_orders() {
        let small = Uuid::from_bytes([1; 16]);
        let large = Uuid::from_bytes([2; 16]);
        assert_eq!(canonical_pair(large, small), (small, large));
        assert_eq!(canonical_pair(small, large), (small, large));
    }

    #[test]
    fn test_link_pair_is_bidirectional() {
        let a = Uuid::from_bytes([1; 16]);
        let b = Uuid::from_bytes([2; 16]);
        let [forward, backward] = LinkRecord::pair(a, b, LinkType::Semantic, 0.8, None);
        assert_eq!(forward.from_unit_id, backward.to_unit_id);
        assert_eq!(forward.to_unit_id, backward.from_unit_id);
        assert_eq!(forward.weight, backward.weight);
    }
}
