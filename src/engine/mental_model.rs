// ── Membank Engine: Mental Models ──────────────────────────────────────────
// Persistence and semantic search for curated summaries: creation, entity
// lookup, refresh writes, and the refreshable listing the lifecycle triggers
// iterate. A mental model is meant to be injected wholesale into a Reflect
// context, so `content` is the payload and everything else is lifecycle
// bookkeeping.

use chrono::{DateTime, Duration, Utc};
use log::info;
use pgvector::Vector;
use serde_json::json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{MentalModel, TagsMatch};
use crate::engine::embedding::embedder;
use crate::engine::visibility;

/// Similarity floor for semantic search.
const SEARCH_SIMILARITY_THRESHOLD: f64 = 0.1;

/// Models not refreshed for this long are flagged stale in search results.
const STALE_THRESHOLD_DAYS: i64 = 7;

const DEFAULT_MAX_TOKENS: i32 = 2_048;

const SELECT_COLUMNS: &str =
    "id, bank_id, name, description, content, source_query, entity_id, \
     source_observation_ids, tags, max_tokens, trigger, last_refreshed_at, \
     created_at, updated_at";

/// Parameters for creating a mental model.
#[derive(Debug, Clone, Default)]
pub struct NewMentalModel {
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub source_query: Option<String>,
    pub tags: Vec<String>,
    pub entity_id: Option<Uuid>,
    pub refresh_after_consolidation: bool,
}

/// A search hit: the model plus its score and staleness flag.
#[derive(Debug, Clone)]
pub struct MentalModelHit {
    pub model: MentalModel,
    pub similarity: f64,
    pub is_stale: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// CRUD
// ═══════════════════════════════════════════════════════════════════════════

/// Insert a new mental model; the content embedding is computed here. A
/// unique-index loss on `(bank_id, entity_id)` surfaces as `Conflict` so the
/// caller can reload the winner.
pub async fn create_mental_model(
    pool: &PgPool,
    bank_id: Uuid,
    new: &NewMentalModel,
) -> EngineResult<MentalModel> {
    let embedding = embedder().embed_one(&new.content).await?;
    let trigger = json!({"refresh_after_consolidation": new.refresh_after_consolidation});

    let result = sqlx::query(&format!(
        "INSERT INTO mental_models (
             bank_id, name, description, content, source_query,
             embedding, entity_id, tags, max_tokens, trigger, last_refreshed_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
         RETURNING {SELECT_COLUMNS}"
    ))
    .bind(bank_id)
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.content)
    .bind(&new.source_query)
    .bind(Vector::from(embedding))
    .bind(new.entity_id)
    .bind(&new.tags)
    .bind(DEFAULT_MAX_TOKENS)
    .bind(trigger)
    .fetch_one(pool)
    .await;

    match result {
        Ok(row) => {
            let model = row_to_model(&row);
            info!("[mental_model] Created '{}' ({}) in bank {}", model.name, model.id, bank_id);
            Ok(model)
        }
        Err(e) => {
            let wrapped = EngineError::from(e);
            if wrapped.is_unique_violation() {
                Err(EngineError::Conflict(format!(
                    "mental model for entity {:?} already exists",
                    new.entity_id
                )))
            } else {
                Err(wrapped)
            }
        }
    }
}

/// The model a given entity already owns, if any.
pub async fn get_by_entity(
    pool: &PgPool,
    bank_id: Uuid,
    entity_id: Uuid,
) -> EngineResult<Option<MentalModel>> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM mental_models WHERE bank_id = $1 AND entity_id = $2"
    ))
    .bind(bank_id)
    .bind(entity_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_model))
}

/// Overwrite content after a refresh: new embedding, new sources, new
/// refresh timestamp. One statement, so a cancelled Reflect either fully
/// committed this or never began it.
pub async fn apply_refresh(
    pool: &PgPool,
    bank_id: Uuid,
    model_id: Uuid,
    content: &str,
    source_observation_ids: &[Uuid],
) -> EngineResult<()> {
    let embedding = embedder().embed_one(content).await?;
    sqlx::query(
        "UPDATE mental_models
         SET content = $1,
             embedding = $2,
             source_observation_ids = $3,
             last_refreshed_at = NOW()
         WHERE id = $4 AND bank_id = $5",
    )
    .bind(content)
    .bind(Vector::from(embedding))
    .bind(source_observation_ids)
    .bind(model_id)
    .bind(bank_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Models opted into post-consolidation refresh, oldest first.
pub async fn refreshable_models(pool: &PgPool, bank_id: Uuid) -> EngineResult<Vec<MentalModel>> {
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM mental_models
         WHERE bank_id = $1
           AND (trigger->>'refresh_after_consolidation')::boolean = true
           AND source_query IS NOT NULL
         ORDER BY created_at ASC"
    ))
    .bind(bank_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_model).collect())
}

// ═══════════════════════════════════════════════════════════════════════════
// Search
// ═══════════════════════════════════════════════════════════════════════════

pub async fn search_mental_models(
    pool: &PgPool,
    bank_id: Uuid,
    query: &str,
    tags: Option<&[String]>,
    tags_match: TagsMatch,
    max_results: usize,
    exclude_ids: &[Uuid],
) -> EngineResult<Vec<MentalModelHit>> {
    let query_embedding = embedder().embed_one(query).await?;
    let vector = Vector::from(query_embedding);

    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
        "SELECT {SELECT_COLUMNS}, 1 - (embedding <=> "
    ));
    qb.push_bind(vector.clone());
    qb.push(") AS similarity FROM mental_models WHERE bank_id = ");
    qb.push_bind(bank_id);
    qb.push(" AND embedding IS NOT NULL AND (1 - (embedding <=> ");
    qb.push_bind(vector.clone());
    qb.push(")) >= ");
    qb.push_bind(SEARCH_SIMILARITY_THRESHOLD);

    if let Some(tags) = tags {
        visibility::push_tags_predicate(&mut qb, tags, tags_match);
    }
    if !exclude_ids.is_empty() {
        qb.push(" AND id != ALL(");
        qb.push_bind(exclude_ids.to_vec());
        qb.push(")");
    }

    qb.push(" ORDER BY embedding <=> ");
    qb.push_bind(vector);
    qb.push(" LIMIT ");
    qb.push_bind(max_results as i64);

    let rows = qb.build().fetch_all(pool).await?;
    let now = Utc::now();
    Ok(rows
        .iter()
        .map(|row| {
            let model = row_to_model(row);
            let is_stale = is_stale(model.last_refreshed_at, now);
            MentalModelHit { similarity: row.get("similarity"), is_stale, model }
        })
        .collect())
}

/// True when the last refresh is missing or too old.
pub fn is_stale(last_refreshed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_refreshed_at {
        None => true,
        Some(at) => now - at >= Duration::days(STALE_THRESHOLD_DAYS),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn row_to_model(row: &sqlx::postgres::PgRow) -> MentalModel {
    let trigger: serde_json::Value = row.get("trigger");
    MentalModel {
        id: row.get("id"),
        bank_id: row.get("bank_id"),
        name: row.get("name"),
        description: row.get("description"),
        content: row.get("content"),
        source_query: row.get("source_query"),
        entity_id: row.get("entity_id"),
        source_observation_ids: row.get("source_observation_ids"),
        tags: row.get("tags"),
        max_tokens: row.get("max_tokens"),
        refresh_after_consolidation: trigger["refresh_after_consolidation"]
            .as_bool()
            .unwrap_or(false),
        last_refreshed_at: row.get("last_refreshed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_staleness_boundary() {
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
        assert!(is_stale(None, now));
        assert!(is_stale(Some(now - Duration::days(7)), now));
        assert!(is_stale(Some(now - Duration::days(30)), now));
        assert!(!is_stale(Some(now - Duration::days(6)), now));
        assert!(!is_stale(Some(now), now));
    }
}
