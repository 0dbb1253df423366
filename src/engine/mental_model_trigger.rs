// ── Membank Engine: Mental Model Lifecycle Triggers ────────────────────────
// Runs after each consolidation pass:
//
//   refresh    — rerun Reflect on the stored source_query of models opted
//                into refresh_after_consolidation whose entity was touched
//                (at most 3 per run)
//   generation — entities with >= 5 observations and no model yet get one
//                generated via a short Reflect (at most 2 per run)
//
// Duplicate generation is blocked three ways: the candidate SQL left-joins
// away entities that already own a model, the application re-checks by
// entity id and by trigram name similarity, and the partial unique index on
// (bank_id, entity_id) is the last line. A lost insert race reloads the
// winner instead of failing.

use log::{debug, info, warn};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ReflectOptions, TagsMatch};
use crate::engine::mental_model::{self, NewMentalModel};
use crate::engine::reflect;

/// Refresh cap per consolidation run, bounding tail latency.
const MAX_REFRESH_PER_CONSOLIDATION: usize = 3;

/// Generation cap per consolidation run.
const MAX_GENERATION_PER_CONSOLIDATION: i64 = 2;

/// Observations an entity needs before it earns a mental model.
const MIN_OBSERVATIONS_FOR_GENERATION: i64 = 5;

/// Generation runs a shortened Reflect.
const GENERATION_MAX_ITERATIONS: u32 = 5;

/// Generated content below this length is discarded as too thin.
const MIN_GENERATED_CONTENT_CHARS: usize = 50;

/// Name similarity above which a manually created model counts as a dup.
const NAME_SIMILARITY_THRESHOLD: f32 = 0.8;

// ═══════════════════════════════════════════════════════════════════════════
// Refresh
// ═══════════════════════════════════════════════════════════════════════════

/// Refresh opted-in models whose entity was touched by this consolidation
/// run (theme models without an entity refresh unconditionally). Returns the
/// number refreshed.
pub async fn refresh_after_consolidation(
    pool: &PgPool,
    bank_id: Uuid,
    touched_observation_ids: &[Uuid],
) -> EngineResult<usize> {
    let models = mental_model::refreshable_models(pool, bank_id).await?;
    if models.is_empty() {
        return Ok(0);
    }

    let touched_entities = entities_of_observations(pool, bank_id, touched_observation_ids).await?;

    let due: Vec<_> = models
        .into_iter()
        .filter(|m| match m.entity_id {
            Some(entity_id) => touched_entities.contains(&entity_id),
            None => true,
        })
        .take(MAX_REFRESH_PER_CONSOLIDATION)
        .collect();

    let mut refreshed = 0usize;
    for model in due {
        let Some(source_query) = model.source_query.clone() else {
            continue;
        };

        // Tagged models search in all_strict mode so a scoped summary can
        // never absorb unscoped or differently-scoped data.
        let tags_match =
            if model.tags.is_empty() { TagsMatch::Any } else { TagsMatch::AllStrict };

        let options = ReflectOptions {
            max_iterations: None,
            tags: if model.tags.is_empty() { None } else { Some(model.tags.clone()) },
            tags_match,
            exclude_mental_model_ids: vec![model.id],
        };

        match reflect::reflect(pool, bank_id, &source_query, &options).await {
            Ok(outcome) if !outcome.answer.is_empty() => {
                mental_model::apply_refresh(
                    pool,
                    bank_id,
                    model.id,
                    &outcome.answer,
                    &outcome.observation_ids,
                )
                .await?;
                refreshed += 1;
                info!("[mental_model] Refreshed '{}' ({})", model.name, model.id);
            }
            Ok(_) => {
                debug!("[mental_model] Refresh of {} produced no answer, keeping old content", model.id);
            }
            Err(e) => {
                warn!("[mental_model] Refresh of {} failed: {e}", model.id);
            }
        }
    }

    Ok(refreshed)
}

// ═══════════════════════════════════════════════════════════════════════════
// Generation
// ═══════════════════════════════════════════════════════════════════════════

/// Generate mental models for entities that crossed the observation
/// threshold in this run. Returns the number generated.
pub async fn generate_for_entities(
    pool: &PgPool,
    bank_id: Uuid,
    touched_observation_ids: &[Uuid],
    mission: &str,
) -> EngineResult<usize> {
    if touched_observation_ids.is_empty() {
        return Ok(0);
    }

    let candidates = find_generation_candidates(pool, bank_id, touched_observation_ids).await?;
    if candidates.is_empty() {
        return Ok(0);
    }

    let mut generated = 0usize;
    for candidate in candidates {
        match generate_one(pool, bank_id, &candidate, mission).await {
            Ok(true) => generated += 1,
            Ok(false) => {}
            Err(e) => warn!(
                "[mental_model] Generation for entity '{}' failed: {e}",
                candidate.canonical_name
            ),
        }
    }

    Ok(generated)
}

#[derive(Debug, Clone)]
struct GenerationCandidate {
    entity_id: Uuid,
    canonical_name: String,
}

/// Entities linked to the touched observations, with enough observations
/// overall and no existing model (first layer of duplicate defense).
async fn find_generation_candidates(
    pool: &PgPool,
    bank_id: Uuid,
    touched_observation_ids: &[Uuid],
) -> EngineResult<Vec<GenerationCandidate>> {
    let rows = sqlx::query(
        "WITH affected_entities AS (
             SELECT DISTINCT ue.entity_id
             FROM unit_entities ue
             WHERE ue.unit_id = ANY($1)
         ),
         entity_obs_counts AS (
             SELECT ue.entity_id, e.canonical_name, COUNT(DISTINCT ue.unit_id) AS obs_count
             FROM unit_entities ue
             JOIN memory_units mu ON ue.unit_id = mu.id
             JOIN entities e ON ue.entity_id = e.id
             WHERE mu.bank_id = $2
               AND mu.fact_type = 'observation'
               AND ue.entity_id IN (SELECT entity_id FROM affected_entities)
             GROUP BY ue.entity_id, e.canonical_name
             HAVING COUNT(DISTINCT ue.unit_id) >= $3
         )
         SELECT eoc.entity_id, eoc.canonical_name
         FROM entity_obs_counts eoc
         LEFT JOIN mental_models mm
             ON mm.entity_id = eoc.entity_id AND mm.bank_id = $2
         WHERE mm.id IS NULL
         ORDER BY eoc.obs_count DESC
         LIMIT $4",
    )
    .bind(touched_observation_ids)
    .bind(bank_id)
    .bind(MIN_OBSERVATIONS_FOR_GENERATION)
    .bind(MAX_GENERATION_PER_CONSOLIDATION)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| GenerationCandidate {
            entity_id: row.get("entity_id"),
            canonical_name: row.get("canonical_name"),
        })
        .collect())
}

/// Returns true when a model was created.
async fn generate_one(
    pool: &PgPool,
    bank_id: Uuid,
    candidate: &GenerationCandidate,
    mission: &str,
) -> EngineResult<bool> {
    // Second layer: re-check by entity id and by name similarity right
    // before the expensive Reflect call.
    if model_already_exists(pool, bank_id, candidate.entity_id, &candidate.canonical_name).await? {
        debug!(
            "[mental_model] Model already exists for '{}', skipping",
            candidate.canonical_name
        );
        return Ok(false);
    }

    let source_query = build_source_query(&candidate.canonical_name, mission);
    let options = ReflectOptions {
        max_iterations: Some(GENERATION_MAX_ITERATIONS),
        ..Default::default()
    };
    let outcome = reflect::reflect(pool, bank_id, &source_query, &options).await?;

    if outcome.answer.chars().count() < MIN_GENERATED_CONTENT_CHARS {
        debug!(
            "[mental_model] Generated content too short for '{}' ({} chars), skipping",
            candidate.canonical_name,
            outcome.answer.chars().count()
        );
        return Ok(false);
    }

    let tags = observation_tags_intersection(pool, bank_id, candidate.entity_id).await?;

    let new = NewMentalModel {
        name: candidate.canonical_name.clone(),
        description: Some(format!("Auto-generated summary of {}", candidate.canonical_name)),
        content: outcome.answer,
        source_query: Some(source_query),
        tags,
        entity_id: Some(candidate.entity_id),
        refresh_after_consolidation: true,
    };

    match mental_model::create_mental_model(pool, bank_id, &new).await {
        Ok(model) => {
            info!(
                "[mental_model] Auto-generated '{}' ({}) for entity {}",
                model.name, model.id, candidate.entity_id
            );
            Ok(true)
        }
        // Third layer: the unique index caught a concurrent generation.
        // Reload the winner's row; this run created nothing.
        Err(EngineError::Conflict(_)) => {
            let winner = mental_model::get_by_entity(pool, bank_id, candidate.entity_id).await?;
            debug!(
                "[mental_model] Lost generation race for '{}', winner is {:?}",
                candidate.canonical_name,
                winner.map(|m| m.id)
            );
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Layers one and two of the duplicate defense: exact entity_id, then
/// trigram similarity against manually created model names.
async fn model_already_exists(
    pool: &PgPool,
    bank_id: Uuid,
    entity_id: Uuid,
    entity_name: &str,
) -> EngineResult<bool> {
    if mental_model::get_by_entity(pool, bank_id, entity_id).await?.is_some() {
        return Ok(true);
    }

    let row = sqlx::query(
        "SELECT id FROM mental_models
         WHERE bank_id = $1 AND similarity(name, $2) >= $3
         LIMIT 1",
    )
    .bind(bank_id)
    .bind(entity_name)
    .bind(NAME_SIMILARITY_THRESHOLD)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

fn build_source_query(entity_name: &str, mission: &str) -> String {
    if mission.is_empty() {
        format!("Summarize everything known about {entity_name} across all stored memories.")
    } else {
        format!(
            "Summarize everything known about {entity_name} across all stored memories. \
             Include the perspective of the mission: {mission}."
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tag inheritance
// ═══════════════════════════════════════════════════════════════════════════

/// Tags shared by every observation backing this entity. The intersection
/// (not the union) keeps a generated model from claiming scopes only some
/// of its evidence carries.
async fn observation_tags_intersection(
    pool: &PgPool,
    bank_id: Uuid,
    entity_id: Uuid,
) -> EngineResult<Vec<String>> {
    let rows = sqlx::query(
        "SELECT mu.tags
         FROM unit_entities ue
         JOIN memory_units mu ON ue.unit_id = mu.id
         WHERE ue.entity_id = $1
           AND mu.bank_id = $2
           AND mu.fact_type = 'observation'",
    )
    .bind(entity_id)
    .bind(bank_id)
    .fetch_all(pool)
    .await?;

    let tag_sets: Vec<Vec<String>> = rows.iter().map(|r| r.get("tags")).collect();
    Ok(intersect_tags(&tag_sets))
}

fn intersect_tags(tag_sets: &[Vec<String>]) -> Vec<String> {
    let Some(first) = tag_sets.first() else {
        return Vec::new();
    };
    let mut shared: Vec<String> = first.clone();
    for set in &tag_sets[1..] {
        shared.retain(|tag| set.contains(tag));
        if shared.is_empty() {
            break;
        }
    }
    shared.sort();
    shared.dedup();
    shared
}

async fn entities_of_observations(
    pool: &PgPool,
    bank_id: Uuid,
    observation_ids: &[Uuid],
) -> EngineResult<std::collections::HashSet<Uuid>> {
    if observation_ids.is_empty() {
        return Ok(std::collections::HashSet::new());
    }
    let rows = sqlx::query(
        "SELECT DISTINCT ue.entity_id
         FROM unit_entities ue
         JOIN memory_units mu ON ue.unit_id = mu.id
         WHERE ue.unit_id = ANY($1) AND mu.bank_id = $2",
    )
    .bind(observation_ids)
    .bind(bank_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| r.get("entity_id")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect_tags() {
        let sets = vec![
            vec!["work".to_string(), "hr".to_string(), "eu".to_string()],
            vec!["hr".to_string(), "work".to_string()],
            vec!["work".to_string(), "hr".to_string(), "legal".to_string()],
        ];
        assert_eq!(intersect_tags(&sets), vec!["hr".to_string(), "work".to_string()]);
    }

    #[test]
    fn test_intersect_tags_disjoint_and_empty() {
        let disjoint = vec![vec!["a".to_string()], vec!["b".to_string()]];
        assert!(intersect_tags(&disjoint).is_empty());
        assert!(intersect_tags(&[]).is_empty());
        // One untagged observation empties the intersection.
        let with_empty = vec![vec!["a".to_string()], vec![]];
        assert!(intersect_tags(&with_empty).is_empty());
    }

    #[test]
    fn test_source_query_includes_mission_when_present() {
        let with = build_source_query("Alice", "track employment");
        assert!(with.contains("Alice"));
        assert!(with.contains("track employment"));
        let without = build_source_query("Alice", "");
        assert!(without.contains("Alice"));
        assert!(!without.contains("mission"));
    }
}
