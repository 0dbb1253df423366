// ── Membank Engine: Entity Resolver ────────────────────────────────────────
// Canonical-name resolution for the `who` participants of a fact.
//
// Matching ladder:
//   1. Exact case-insensitive match on (bank_id, lower(canonical_name)):
//      bump mention_count / last_seen, return the existing row.
//   2. Best pg_trgm similarity >= 0.6 within the bank: treat the input as an
//      alias of that entity, bump counters, return it.
//   3. Insert a new row (first_seen = last_seen = now).
//
// Every resolution runs on the caller's transaction so a failed Retain never
// leaves orphaned entities behind.

use log::info;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::atoms::error::EngineResult;
use crate::atoms::types::EntityType;

/// Minimum trigram similarity for an alias match.
const TRIGRAM_SIMILARITY_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub id: Uuid,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub is_new: bool,
}

/// Resolve one name within the caller's transaction.
pub async fn resolve(
    conn: &mut PgConnection,
    bank_id: Uuid,
    name: &str,
    type_hint: Option<EntityType>,
) -> EngineResult<ResolvedEntity> {
    let name = name.trim();
    let entity_type = type_hint.unwrap_or(EntityType::Person);

    // 1. Exact case-insensitive hit.
    if let Some(row) = sqlx::query(
        "UPDATE entities
         SET mention_count = mention_count + 1, last_seen = NOW()
         WHERE bank_id = $1 AND lower(canonical_name) = lower($2)
         RETURNING id, canonical_name, entity_type",
    )
    .bind(bank_id)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    {
        return Ok(row_to_entity(&row, false));
    }

    // 2. Trigram alias match within the same bank.
    if let Some(row) = sqlx::query(
        "SELECT id FROM entities
         WHERE bank_id = $1 AND similarity(canonical_name, $2) >= $3
         ORDER BY similarity(canonical_name, $2) DESC
         LIMIT 1",
    )
    .bind(bank_id)
    .bind(name)
    .bind(TRIGRAM_SIMILARITY_THRESHOLD)
    .fetch_optional(&mut *conn)
    .await?
    {
        let id: Uuid = row.get("id");
        let updated = sqlx::query(
            "UPDATE entities
             SET mention_count = mention_count + 1, last_seen = NOW()
             WHERE id = $1
             RETURNING id, canonical_name, entity_type",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
        return Ok(row_to_entity(&updated, false));
    }

    // 3. New entity. ON CONFLICT absorbs a same-transaction duplicate name.
    let row = sqlx::query(
        "INSERT INTO entities (bank_id, canonical_name, entity_type)
         VALUES ($1, $2, $3)
         ON CONFLICT (bank_id, lower(canonical_name)) DO UPDATE
             SET mention_count = entities.mention_count + 1,
                 last_seen = NOW()
         RETURNING id, canonical_name, entity_type",
    )
    .bind(bank_id)
    .bind(name)
    .bind(entity_type.as_str())
    .fetch_one(&mut *conn)
    .await?;

    let resolved = row_to_entity(&row, true);
    info!(
        "[entity] New entity '{}' ({}) in bank {}",
        resolved.canonical_name,
        resolved.entity_type.as_str(),
        bank_id
    );
    Ok(resolved)
}

/// Resolve a batch of names, deduplicating repeats within the batch by their
/// lowercase form so one fact mentioning "Alice" twice bumps her once.
pub async fn resolve_many(
    conn: &mut PgConnection,
    bank_id: Uuid,
    names: &[String],
    type_hint: Option<EntityType>,
) -> EngineResult<Vec<ResolvedEntity>> {
    let mut resolved: Vec<ResolvedEntity> = Vec::new();
    let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for name in names {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = trimmed.to_lowercase();
        if let Some(&idx) = seen.get(&key) {
            let existing = resolved[idx].clone();
            resolved.push(existing);
            continue;
        }
        let entity = resolve(&mut *conn, bank_id, trimmed, type_hint).await?;
        seen.insert(key, resolved.len());
        resolved.push(entity);
    }

    Ok(resolved)
}

fn row_to_entity(row: &sqlx::postgres::PgRow, is_new: bool) -> ResolvedEntity {
    let type_str: String = row.get("entity_type");
    ResolvedEntity {
        id: row.get("id"),
        canonical_name: row.get("canonical_name"),
        entity_type: EntityType::parse(&type_str).unwrap_or(EntityType::Other),
        is_new,
    }
}
