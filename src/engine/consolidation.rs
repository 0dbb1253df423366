// ── Membank Engine: Consolidation Worker ───────────────────────────────────
// Converts unconsolidated raw facts into observations. For each fact: find
// related observations (Recall restricted to observations), ask the
// consolidation model to classify (REDUNDANT / CONTRADICTION / UPDATE / NEW
// expressed as create/update/skip actions), then apply the actions and stamp
// `consolidated_at` in one transaction per fact.
//
// Failure policy: one fact's failure never poisons the batch. The fact is
// left unstamped for the next cycle and a failed row lands in
// async_operations. A batch in which nothing could be stamped ends the run
// so a persistent upstream outage cannot spin the worker.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use pgvector::Vector;
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::CompletionRequest;
use crate::atoms::types::{FactType, RecallOptions};
use crate::engine::config;
use crate::engine::embedding::embedder;
use crate::engine::freshness;
use crate::engine::graph;
use crate::engine::mental_model_trigger;
use crate::engine::ops;
use crate::engine::providers;
use crate::engine::recall;

const CONSOLIDATION_BATCH_SIZE: i64 = 10;

/// Observations offered to the classifier per fact.
const MAX_RELATED_OBSERVATIONS: usize = 50;

/// Token budget for the observation-context recall.
const RELATED_OBSERVATIONS_MAX_TOKENS: usize = 8_192;

/// Source memories quoted per observation in the classifier prompt.
const MAX_SOURCE_MEMORIES_PER_OBS: usize = 3;

const CLASSIFY_MAX_TOKENS: u32 = 2_048;

const WORKER_ID: &str = "consolidation";

// ═══════════════════════════════════════════════════════════════════════════
// Prompts
// ═══════════════════════════════════════════════════════════════════════════

const SYSTEM_PROMPT: &str = "\
You are a memory consolidation system. You extract durable knowledge (observations) from facts and merge it correctly into existing knowledge.

Output only valid JSON. No markdown code fences, no extra text.

## Extract durable knowledge (not ephemeral state)

Facts often describe events or actions. Extract the durable knowledge a fact implies, not the transient state it describes.

Examples:
- \"The user moved to room 203\" -> \"Room 203 exists\" (not the user's current location)
- \"Visited Acme Corp in room 105\" -> \"Acme Corp is in room 105\"
- \"Met Sarah in the lobby\" -> \"Sarah is sometimes in the lobby\"

Do not track the user's current location or momentary state as knowledge (it changes constantly). Track the durable facts their actions reveal.

## Preserve concrete detail

Keep names, places, numbers, and other specifics. Do NOT:
- abstract into general principles
- generate business insights
- make knowledge generic

Good:
- Fact: \"Taro likes pizza\" -> \"Taro likes pizza\"
- Fact: \"Hanako works at Google\" -> \"Hanako works at Google\"

Bad:
- \"Taro likes pizza\" -> \"Understanding food preferences is...\" (over-abstracted)
- \"The user is in room 203\" -> \"The user is currently in room 203\" (ephemeral state)

## Merge rules (against existing observations)

1. REDUNDANT: a rephrasing of the same information -> update the existing observation (its proof count grows)
2. CONTRADICTION: conflicting information on the same topic -> update with a temporal marker, e.g. \"Taro used to like pizza, but now dislikes it\"
3. UPDATE: an old state replaced by a new one -> express the transition: \"used to X, now Y\"

## Hard constraints

- NEVER merge facts about different people. Compare the people involved before updating anything.
- NEVER merge unrelated topics (food preferences vs work vs hobbies).
- When merging a contradiction, the text MUST record both states with a temporal marker (\"used to X, now Y\", \"changed from X to Y\"). Never state only the new fact.
- One observation stays focused on one person and one topic.
- Observation text records durable knowledge only, never transient state.";

fn build_user_prompt(fact_text: &str, observations_json: &str, mission: &str) -> String {
    let mission_section = if mission.is_empty() {
        String::new()
    } else {
        format!("\nMission: {mission}\nFocus on durable knowledge that serves this mission.\n")
    };

    format!(
        "Analyze this new fact and integrate it into the knowledge base.\n\
         {mission_section}\n\
         New fact: {fact_text}\n\n\
         Existing observations (JSON array, with their supporting source memories):\n\
         {observations_json}\n\n\
         Each observation has:\n\
         - id: unique identifier for updates\n\
         - text: the observation content\n\
         - proof_count: number of supporting memories\n\
         - source_memories: the original memories behind it (text and date)\n\n\
         Steps:\n\
         1. Extract the durable knowledge from the new fact (not transient state).\n\
         2. Read each observation's source_memories to understand its grounding.\n\
         3. Check dates to detect contradictions or updates.\n\
         4. Compare against the observations:\n\
            - same topic and same person -> UPDATE with its learning_id\n\
            - new topic -> CREATE\n\
            - purely transient -> return an empty array []\n\n\
         Output a JSON array of actions:\n\
         [\n\
           {{\"action\": \"update\", \"learning_id\": \"uuid of existing observation\", \"text\": \"updated knowledge\", \"reason\": \"why\"}},\n\
           {{\"action\": \"create\", \"text\": \"new durable knowledge\", \"reason\": \"why\"}},\n\
           {{\"action\": \"skip\", \"reason\": \"why nothing durable\"}}\n\
         ]\n\n\
         Return [] when the fact carries no durable knowledge."
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// Data carried through a run
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct PendingFact {
    id: Uuid,
    text: String,
    event_date: Option<DateTime<Utc>>,
    occurred_start: Option<DateTime<Utc>>,
    occurred_end: Option<DateTime<Utc>>,
    mentioned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct RelatedObservation {
    id: Uuid,
    text: String,
    proof_count: i32,
    source_memories: Vec<Value>,
}

/// A validated classifier action.
#[derive(Debug, Clone, PartialEq)]
enum Action {
    Create { text: String },
    Update { learning_id: Uuid, text: String, reason: String },
    Skip,
}

#[derive(Debug, Default, Clone)]
pub struct ConsolidationStats {
    pub processed: usize,
    pub observations_created: usize,
    pub observations_updated: usize,
    pub skipped: usize,
    pub affected_observation_ids: Vec<Uuid>,
    pub mental_models_refreshed: usize,
    pub mental_models_generated: usize,
    pub freshness_updated: usize,
}

impl ConsolidationStats {
    pub fn to_json(&self) -> Value {
        json!({
            "processed": self.processed,
            "observations_created": self.observations_created,
            "observations_updated": self.observations_updated,
            "skipped": self.skipped,
            "mental_models_refreshed": self.mental_models_refreshed,
            "mental_models_generated": self.mental_models_generated,
            "freshness_updated": self.freshness_updated,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

/// Run consolidation for one bank until its unconsolidated queue drains, a
/// batch makes no progress, or shutdown is requested.
pub async fn consolidate_bank(
    pool: &PgPool,
    bank_id: Uuid,
    shutdown: &AtomicBool,
) -> EngineResult<ConsolidationStats> {
    let started = std::time::Instant::now();
    let mission = load_mission(pool, bank_id).await?;

    let mut stats = ConsolidationStats::default();

    'run: loop {
        let facts = fetch_unconsolidated(pool, bank_id).await?;
        if facts.is_empty() {
            break;
        }

        let mut stamped_in_batch = 0usize;
        for fact in &facts {
            if shutdown.load(Ordering::Relaxed) {
                info!("[consolidation] Shutdown requested, exiting cleanly");
                break 'run;
            }

            match process_fact(pool, bank_id, fact, &mission).await {
                Ok(outcome) => {
                    stamped_in_batch += 1;
                    stats.processed += 1;
                    stats.observations_created += outcome.created;
                    stats.observations_updated += outcome.updated;
                    if outcome.created == 0 && outcome.updated == 0 {
                        stats.skipped += 1;
                    }
                    stats.affected_observation_ids.extend(outcome.observation_ids);
                }
                Err(e) => {
                    warn!("[consolidation] Fact {} failed, will retry next cycle: {e}", fact.id);
                    ops::record_failure(
                        pool,
                        bank_id,
                        "consolidate_fact",
                        WORKER_ID,
                        json!({"fact_id": fact.id}),
                        &e.to_string(),
                    )
                    .await;
                }
            }
        }

        // A batch with zero progress means every fact is failing upstream;
        // stop and let the next cycle retry.
        if stamped_in_batch == 0 {
            warn!("[consolidation] No progress in batch for bank {}, ending run", bank_id);
            break;
        }
    }

    stats.affected_observation_ids.sort();
    stats.affected_observation_ids.dedup();

    if stats.processed > 0 {
        finish_run(pool, bank_id, &mission, &mut stats).await;
    }

    info!(
        "[consolidation] Complete for bank {}: processed={}, created={}, updated={}, skipped={}, \
         mm_refreshed={}, mm_generated={} ({}ms)",
        bank_id,
        stats.processed,
        stats.observations_created,
        stats.observations_updated,
        stats.skipped,
        stats.mental_models_refreshed,
        stats.mental_models_generated,
        started.elapsed().as_millis()
    );

    Ok(stats)
}

/// Banks that currently have unconsolidated facts.
pub async fn banks_with_pending_facts(pool: &PgPool) -> EngineResult<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT DISTINCT bank_id
         FROM memory_units
         WHERE consolidated_at IS NULL
           AND fact_type IN ('world', 'experience')",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| r.get("bank_id")).collect())
}

// ═══════════════════════════════════════════════════════════════════════════
// Post-run maintenance
// ═══════════════════════════════════════════════════════════════════════════

/// Freshness, observation chaining, co-occurrence, mental models. All
/// best-effort: the consolidation result stands even if these trail off.
async fn finish_run(
    pool: &PgPool,
    bank_id: Uuid,
    mission: &str,
    stats: &mut ConsolidationStats,
) {
    match freshness::update_freshness_for_bank(pool, bank_id).await {
        Ok(n) => stats.freshness_updated = n,
        Err(e) => warn!("[consolidation] Freshness update failed for bank {}: {e}", bank_id),
    }

    let touched = stats.affected_observation_ids.clone();
    if !touched.is_empty() {
        match touched_entities(pool, bank_id, &touched).await {
            Ok(entity_ids) => {
                if let Err(e) =
                    graph::link_consecutive_observations(pool, bank_id, &entity_ids).await
                {
                    warn!("[consolidation] Observation chaining failed: {e}");
                }
            }
            Err(e) => warn!("[consolidation] Touched-entity lookup failed: {e}"),
        }

        if let Ok(mut conn) = pool.acquire().await {
            if let Err(e) = graph::update_entity_cooccurrences(&mut conn, bank_id, &touched).await {
                warn!("[consolidation] Co-occurrence update failed: {e}");
            }
        }
    }

    match mental_model_trigger::refresh_after_consolidation(pool, bank_id, &touched).await {
        Ok(n) => stats.mental_models_refreshed = n,
        Err(e) => warn!("[consolidation] Mental model refresh failed: {e}"),
    }

    match mental_model_trigger::generate_for_entities(pool, bank_id, &touched, mission).await {
        Ok(n) => stats.mental_models_generated = n,
        Err(e) => warn!("[consolidation] Mental model generation failed: {e}"),
    }
}

async fn touched_entities(
    pool: &PgPool,
    bank_id: Uuid,
    observation_ids: &[Uuid],
) -> EngineResult<Vec<Uuid>> {
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

// ═══════════════════════════════════════════════════════════════════════════
// Fact processing
// ═══════════════════════════════════════════════════════════════════════════

async fn load_mission(pool: &PgPool, bank_id: Uuid) -> EngineResult<String> {
    let row = sqlx::query("SELECT mission FROM banks WHERE id = $1")
        .bind(bank_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(row.get("mission")),
        None => Err(EngineError::invalid("unknown bank")),
    }
}

async fn fetch_unconsolidated(pool: &PgPool, bank_id: Uuid) -> EngineResult<Vec<PendingFact>> {
    let rows = sqlx::query(
        "SELECT id, text, event_date, occurred_start, occurred_end, mentioned_at
         FROM memory_units
         WHERE bank_id = $1
           AND consolidated_at IS NULL
           AND fact_type IN ('world', 'experience')
         ORDER BY created_at ASC
         LIMIT $2",
    )
    .bind(bank_id)
    .bind(CONSOLIDATION_BATCH_SIZE)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PendingFact {
            id: row.get("id"),
            text: row.get("text"),
            event_date: row.get("event_date"),
            occurred_start: row.get("occurred_start"),
            occurred_end: row.get("occurred_end"),
            mentioned_at: row.get("mentioned_at"),
        })
        .collect())
}

struct FactOutcome {
    created: usize,
    updated: usize,
    observation_ids: Vec<Uuid>,
}

async fn process_fact(
    pool: &PgPool,
    bank_id: Uuid,
    fact: &PendingFact,
    mission: &str,
) -> EngineResult<FactOutcome> {
    // 1. Related observations via Recall, observation-scoped.
    let observations = find_related_observations(pool, bank_id, &fact.text).await?;

    // 2. LLM classification.
    let actions = classify(&fact.text, &observations, mission).await?;

    // 3. Pre-compute embeddings for the texts we are about to write, so the
    //    transaction below never waits on a provider.
    enum Plan {
        Create { text: String, embedding: Vec<f32> },
        Update { learning_id: Uuid, text: String, reason: String, embedding: Vec<f32> },
    }

    let mut plans: Vec<Plan> = Vec::with_capacity(actions.len());
    for action in actions {
        match action {
            Action::Create { text } => {
                let embedding = embedder().embed_one(&text).await?;
                plans.push(Plan::Create { text, embedding });
            }
            Action::Update { learning_id, text, reason } => {
                if !observations.iter().any(|o| o.id == learning_id) {
                    warn!(
                        "[consolidation] Update targets unknown observation {}, skipping action",
                        learning_id
                    );
                    continue;
                }
                let embedding = embedder().embed_one(&text).await?;
                plans.push(Plan::Update { learning_id, text, reason, embedding });
            }
            Action::Skip => {}
        }
    }

    // 4. Apply everything and stamp the fact, atomically.
    let mut outcome = FactOutcome { created: 0, updated: 0, observation_ids: Vec::new() };
    let mut tx = pool.begin().await?;

    for plan in &plans {
        match plan {
            Plan::Create { text, embedding } => {
                let observation_id = apply_create(&mut tx, bank_id, fact, text, embedding).await?;
                outcome.created += 1;
                outcome.observation_ids.push(observation_id);
            }
            Plan::Update { learning_id, text, reason, embedding } => {
                if apply_update(&mut tx, bank_id, fact, *learning_id, text, reason, embedding)
                    .await?
                {
                    outcome.updated += 1;
                    outcome.observation_ids.push(*learning_id);
                }
            }
        }
    }

    sqlx::query("UPDATE memory_units SET consolidated_at = NOW() WHERE id = $1")
        .bind(fact.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    debug!(
        "[consolidation] Fact {} -> created={}, updated={}",
        fact.id, outcome.created, outcome.updated
    );
    Ok(outcome)
}

// ═══════════════════════════════════════════════════════════════════════════
// Context retrieval
// ═══════════════════════════════════════════════════════════════════════════

async fn find_related_observations(
    pool: &PgPool,
    bank_id: Uuid,
    fact_text: &str,
) -> EngineResult<Vec<RelatedObservation>> {
    let options = RecallOptions {
        max_results: Some(MAX_RELATED_OBSERVATIONS),
        max_tokens: Some(RELATED_OBSERVATIONS_MAX_TOKENS),
        fact_types: Some(vec![FactType::Observation]),
        ..Default::default()
    };
    let response = recall::recall(pool, bank_id, fact_text, &options).await?;
    if response.results.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = response.results.iter().map(|hit| hit.id).collect();
    let rows = sqlx::query(
        "SELECT id, text, proof_count, source_memory_ids
         FROM memory_units
         WHERE id = ANY($1) AND bank_id = $2",
    )
    .bind(&ids)
    .bind(bank_id)
    .fetch_all(pool)
    .await?;

    let mut observations = Vec::with_capacity(rows.len());
    for row in &rows {
        let source_ids: Vec<Uuid> = row.get("source_memory_ids");
        let source_memories = fetch_source_memories(pool, bank_id, &source_ids).await?;
        observations.push(RelatedObservation {
            id: row.get("id"),
            text: row.get("text"),
            proof_count: row.get("proof_count"),
            source_memories,
        });
    }
    Ok(observations)
}

async fn fetch_source_memories(
    pool: &PgPool,
    bank_id: Uuid,
    source_ids: &[Uuid],
) -> EngineResult<Vec<Value>> {
    if source_ids.is_empty() {
        return Ok(Vec::new());
    }
    let limited: Vec<Uuid> = source_ids.iter().take(MAX_SOURCE_MEMORIES_PER_OBS).copied().collect();
    let rows = sqlx::query(
        "SELECT text, event_date, occurred_start
         FROM memory_units
         WHERE id = ANY($1) AND bank_id = $2
         ORDER BY created_at ASC",
    )
    .bind(&limited)
    .bind(bank_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            json!({
                "text": row.get::<String, _>("text"),
                "event_date": row.get::<Option<DateTime<Utc>>, _>("event_date")
                    .map(|d| d.to_rfc3339()),
                "occurred_start": row.get::<Option<DateTime<Utc>>, _>("occurred_start")
                    .map(|d| d.to_rfc3339()),
            })
        })
        .collect())
}

// ═══════════════════════════════════════════════════════════════════════════
// Classification
// ═══════════════════════════════════════════════════════════════════════════

async fn classify(
    fact_text: &str,
    observations: &[RelatedObservation],
    mission: &str,
) -> EngineResult<Vec<Action>> {
    let observations_json = serialize_observations(observations);
    let user_prompt = build_user_prompt(fact_text, &observations_json, mission);

    let model = config::consolidation_model_id();
    let output = providers::llm()
        .complete(CompletionRequest {
            model: &model,
            system: SYSTEM_PROMPT,
            user: &user_prompt,
            max_tokens: CLASSIFY_MAX_TOKENS,
        })
        .await?;

    let raw_actions = crate::engine::extraction::extract_json_array(&output);
    Ok(validate_actions(&raw_actions))
}

fn serialize_observations(observations: &[RelatedObservation]) -> String {
    let list: Vec<Value> = observations
        .iter()
        .map(|obs| {
            json!({
                "id": obs.id,
                "text": obs.text,
                "proof_count": obs.proof_count.max(1),
                "source_memories": obs.source_memories,
            })
        })
        .collect();
    serde_json::to_string_pretty(&list).unwrap_or_else(|_| "[]".to_string())
}

/// Keep only well-formed actions; log and drop the rest.
fn validate_actions(raw: &[Value]) -> Vec<Action> {
    let mut actions = Vec::new();
    for entry in raw {
        match entry["action"].as_str() {
            Some("create") => match entry["text"].as_str() {
                Some(text) if !text.trim().is_empty() => {
                    actions.push(Action::Create { text: text.trim().to_string() });
                }
                _ => warn!("[consolidation] create action without text: {entry}"),
            },
            Some("update") => {
                let learning_id = entry["learning_id"].as_str().and_then(|s| Uuid::parse_str(s).ok());
                let text = entry["text"].as_str().map(str::trim).filter(|t| !t.is_empty());
                match (learning_id, text) {
                    (Some(learning_id), Some(text)) => actions.push(Action::Update {
                        learning_id,
                        text: text.to_string(),
                        reason: entry["reason"].as_str().unwrap_or("Updated with new fact").to_string(),
                    }),
                    _ => warn!("[consolidation] invalid update action: {entry}"),
                }
            }
            Some("skip") => actions.push(Action::Skip),
            _ => warn!("[consolidation] unknown action: {entry}"),
        }
    }
    actions
}

// ═══════════════════════════════════════════════════════════════════════════
// Action application
// ═══════════════════════════════════════════════════════════════════════════

async fn apply_create(
    conn: &mut PgConnection,
    bank_id: Uuid,
    fact: &PendingFact,
    text: &str,
    embedding: &[f32],
) -> EngineResult<Uuid> {
    let now = Utc::now();

    // Tags travel from the source fact onto the new observation.
    let row = sqlx::query(
        "INSERT INTO memory_units (
             bank_id, text, embedding, fact_type,
             proof_count, source_memory_ids, history,
             event_date, occurred_start, occurred_end, mentioned_at, tags
         )
         SELECT $1, $2, $3, 'observation',
                1, ARRAY[$4::uuid], '[]'::jsonb,
                $5, $6, $7, $8, src.tags
         FROM memory_units src
         WHERE src.id = $4
         RETURNING id",
    )
    .bind(bank_id)
    .bind(text)
    .bind(Vector::from(embedding.to_vec()))
    .bind(fact.id)
    .bind(fact.event_date)
    .bind(fact.occurred_start.unwrap_or(now))
    .bind(fact.occurred_end.unwrap_or(now))
    .bind(fact.mentioned_at.unwrap_or(now))
    .fetch_one(&mut *conn)
    .await?;

    let observation_id: Uuid = row.get("id");
    inherit_entity_links(conn, observation_id, fact.id).await?;

    debug!("[consolidation] Created observation {} from fact {}", observation_id, fact.id);
    Ok(observation_id)
}

/// Returns false when the target observation vanished between retrieval and
/// application (deleted concurrently); the action is dropped silently.
async fn apply_update(
    conn: &mut PgConnection,
    bank_id: Uuid,
    fact: &PendingFact,
    observation_id: Uuid,
    new_text: &str,
    reason: &str,
    embedding: &[f32],
) -> EngineResult<bool> {
    let Some(current) = sqlx::query(
        "SELECT history FROM memory_units
         WHERE id = $1 AND bank_id = $2 AND fact_type = 'observation'
         FOR UPDATE",
    )
    .bind(observation_id)
    .bind(bank_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        warn!("[consolidation] Observation {} not found for update", observation_id);
        return Ok(false);
    };

    // Append-only history of {at, change}.
    let mut history: Vec<Value> = match current.get::<Value, _>("history") {
        Value::Array(items) => items,
        _ => Vec::new(),
    };
    history.push(json!({
        "at": Utc::now().to_rfc3339(),
        "change": reason,
    }));

    sqlx::query(
        "UPDATE memory_units
         SET text = $1,
             embedding = $2,
             history = $3,
             source_memory_ids = CASE
                 WHEN $4 = ANY(source_memory_ids) THEN source_memory_ids
                 ELSE array_append(source_memory_ids, $4)
             END,
             proof_count = CASE
                 WHEN $4 = ANY(source_memory_ids) THEN cardinality(source_memory_ids)
                 ELSE cardinality(source_memory_ids) + 1
             END,
             occurred_start = LEAST(occurred_start, COALESCE($5, occurred_start)),
             occurred_end = GREATEST(occurred_end, COALESCE($6, occurred_end)),
             mentioned_at = GREATEST(mentioned_at, COALESCE($7, mentioned_at))
         WHERE id = $8",
    )
    .bind(new_text)
    .bind(Vector::from(embedding.to_vec()))
    .bind(Value::Array(history))
    .bind(fact.id)
    .bind(fact.occurred_start)
    .bind(fact.occurred_end)
    .bind(fact.mentioned_at)
    .bind(observation_id)
    .execute(&mut *conn)
    .await?;

    inherit_entity_links(conn, observation_id, fact.id).await?;

    debug!("[consolidation] Updated observation {} from fact {}", observation_id, fact.id);
    Ok(true)
}

/// Every entity on the source fact becomes associated with the observation.
async fn inherit_entity_links(
    conn: &mut PgConnection,
    observation_id: Uuid,
    fact_id: Uuid,
) -> EngineResult<()> {
    sqlx::query(
        "INSERT INTO unit_entities (unit_id, entity_id)
         SELECT $1, entity_id FROM unit_entities WHERE unit_id = $2
         ON CONFLICT DO NOTHING",
    )
    .bind(observation_id)
    .bind(fact_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_actions_mixed() {
        let raw = vec![
            json!({"action": "create", "text": "Alice works at Acme", "reason": "new"}),
            json!({"action": "update", "learning_id": "not-a-uuid", "text": "x"}),
            json!({"action": "update",
                   "learning_id": "8b7e9a52-5c9e-4a0f-9e1a-0c1d2e3f4a5b",
                   "text": "Alice used to work at Acme, now works at Initech",
                   "reason": "job change"}),
            json!({"action": "create", "text": "   "}),
            json!({"action": "skip", "reason": "transient"}),
            json!({"action": "merge", "text": "nope"}),
        ];
        let actions = validate_actions(&raw);
        assert_eq!(actions.len(), 3);
        assert!(matches!(&actions[0], Action::Create { text } if text == "Alice works at Acme"));
        assert!(matches!(&actions[1], Action::Update { reason, .. } if reason == "job change"));
        assert_eq!(actions[2], Action::Skip);
    }

    #[test]
    fn test_validate_actions_empty_means_skip_everything() {
        assert!(validate_actions(&[]).is_empty());
    }

    #[test]
    fn test_user_prompt_contains_fact_and_mission() {
        let prompt = build_user_prompt("Alice left Acme", "[]", "track employment history");
        assert!(prompt.contains("New fact: Alice left Acme"));
        assert!(prompt.contains("Mission: track employment history"));
        assert!(prompt.contains("\"action\": \"update\""));

        let no_mission = build_user_prompt("x", "[]", "");
        assert!(!no_mission.contains("Mission:"));
    }

    #[test]
    fn test_serialize_observations_floors_proof_count() {
        let obs = RelatedObservation {
            id: Uuid::from_bytes([7; 16]),
            text: "Alice works at Acme".into(),
            proof_count: 0,
            source_memories: vec![],
        };
        let serialized = serialize_observations(&[obs]);
        let parsed: Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed[0]["proof_count"], 1);
    }
}
