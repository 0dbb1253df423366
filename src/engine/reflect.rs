// ── Membank Engine: Reflect Loop ───────────────────────────────────────────
// Bounded tool-use agent over the three memory tiers. The model searches
// mental models, observations, and raw facts, expands units for detail, and
// finalizes through the `done` tool, whose citations are validated against
// the ids actually returned by tools in this invocation.
//
// Loop contract:
//   • serial tool execution, one call in flight at a time, every result
//     echoed back into the next turn
//   • at most `max_iterations` turns (default 10; generation uses 5), then
//     a no-confident-answer fallback
//   • 300 s wall clock, enforced with a timeout that maps to TIMEOUT
//   • the bank id lives in the context closure, never in a tool parameter,
//     so a prompt-injected model cannot reach across tenants

use std::collections::HashSet;
use std::time::Duration;

use log::{info, warn};
use pgvector::Vector;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{
    ContentPart, ConverseMessage, ConverseRequest, ConverseRole, StopReason, ToolSpec,
};
use crate::atoms::types::{ReflectOptions, ReflectOutcome, ReflectToolCall, TagsMatch};
use crate::engine::config;
use crate::engine::directive;
use crate::engine::disposition;
use crate::engine::embedding::embedder;
use crate::engine::mental_model;
use crate::engine::providers;
use crate::engine::recall::MAX_QUERY_LENGTH;
use crate::engine::visibility;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

const REFLECT_TIMEOUT_SECS: u64 = 300;
const RESPONSE_MAX_TOKENS: u32 = 4_096;

// Tool defaults and clamps.
const MENTAL_MODEL_SEARCH_DEFAULT: usize = 5;
const MENTAL_MODEL_SEARCH_CLAMP: usize = 20;
const OBSERVATION_SEARCH_DEFAULT: usize = 20;
const OBSERVATION_SEARCH_CLAMP: usize = 50;
const RECALL_SEARCH_DEFAULT: usize = 30;
const RECALL_SEARCH_CLAMP: usize = 100;
const EXPAND_CHUNK_LIMIT: i64 = 100;

const SIMILARITY_THRESHOLD: f64 = 0.1;

/// Answers at or under this length may finalize without citations (they are
/// read as uncertainty admissions); longer answers need evidence.
const TRIVIAL_ANSWER_MAX_CHARS: usize = 120;

const NO_CONFIDENT_ANSWER: &str =
    "I could not gather enough evidence to answer confidently within the allotted steps.";

const REFLECT_SYSTEM_PROMPT: &str = "\
You are an agent that reasons deeply over stored memories. Use the provided tools to gather
evidence from the three memory tiers and produce a grounded answer.

## Search hierarchy (in priority order)

1. **search_mental_models** - curated summaries. Highest-quality knowledge; search these first.
2. **search_observations** - consolidated knowledge; durable patterns extracted from facts.
3. **recall** - raw facts (ground truth); the original memory text. Use for verification and detail.
4. **expand** - the full context of one specific memory, including its who/what/when/where/why.

## Reasoning rules

- Use ONLY information from tool results. Never fill gaps from your own knowledge.
- Always attach the supporting evidence ids to your answer (the done tool's cited_ids field).
- Decompose complex questions and search multiple times.
- Gather sufficient evidence before calling done.
- Put the answer in the done tool's answer field; never put ids in the answer text.";

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

/// Run one Reflect invocation.
pub async fn reflect(
    pool: &PgPool,
    bank_id: Uuid,
    query: &str,
    options: &ReflectOptions,
) -> EngineResult<ReflectOutcome> {
    if query.trim().is_empty() {
        return Err(EngineError::invalid("query is required"));
    }
    if query.chars().count() > MAX_QUERY_LENGTH {
        return Err(EngineError::invalid(format!(
            "query exceeds maximum length of {MAX_QUERY_LENGTH}"
        )));
    }

    let started = std::time::Instant::now();

    let disposition = disposition::load_disposition(pool, bank_id).await?;
    let directives = directive::load_directives(pool, bank_id).await?;

    let system_prompt = build_system_prompt(&disposition, &directives);
    let tools = build_tool_catalog(!directives.is_empty());
    let max_iterations = options.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS).max(1);

    let mut ctx = ReflectContext {
        pool,
        bank_id,
        tags: options.tags.clone(),
        tags_match: options.tags_match,
        exclude_mental_model_ids: options.exclude_mental_model_ids.clone(),
        directives,
        available_memory_ids: HashSet::new(),
        available_observation_ids: HashSet::new(),
        available_mental_model_ids: HashSet::new(),
        tool_calls: Vec::new(),
        directive_retry_used: false,
    };

    let loop_result = tokio::time::timeout(
        Duration::from_secs(REFLECT_TIMEOUT_SECS),
        agent_loop(&mut ctx, query, &system_prompt, &tools, max_iterations),
    )
    .await;

    let mut outcome = match loop_result {
        Ok(result) => result?,
        Err(_) => {
            return Err(EngineError::Timeout(format!(
                "reflect exceeded {REFLECT_TIMEOUT_SECS}s"
            )))
        }
    };
    outcome.elapsed_ms = started.elapsed().as_millis() as u64;

    info!(
        "[reflect] Complete for bank {}: iterations={}, cited={}, answer_len={} ({}ms)",
        bank_id,
        outcome.iterations,
        outcome.cited_ids.len(),
        outcome.answer.chars().count(),
        outcome.elapsed_ms
    );
    Ok(outcome)
}

// ═══════════════════════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════════════════════

struct ReflectContext<'a> {
    pool: &'a PgPool,
    bank_id: Uuid,
    tags: Option<Vec<String>>,
    tags_match: TagsMatch,
    exclude_mental_model_ids: Vec<Uuid>,
    directives: Vec<String>,

    // Ids actually returned by tools this invocation; the only ids `done`
    // may cite.
    available_memory_ids: HashSet<Uuid>,
    available_observation_ids: HashSet<Uuid>,
    available_mental_model_ids: HashSet<Uuid>,

    tool_calls: Vec<ReflectToolCall>,
    directive_retry_used: bool,
}

impl ReflectContext<'_> {
    fn has_any_evidence(&self) -> bool {
        !self.available_memory_ids.is_empty()
            || !self.available_observation_ids.is_empty()
            || !self.available_mental_model_ids.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Loop
// ═══════════════════════════════════════════════════════════════════════════

async fn agent_loop(
    ctx: &mut ReflectContext<'_>,
    query: &str,
    system_prompt: &str,
    tools: &[ToolSpec],
    max_iterations: u32,
) -> EngineResult<ReflectOutcome> {
    let mut messages = vec![ConverseMessage::user_text(query)];
    let model = config::reflect_model_id();

    for iteration in 0..max_iterations {
        let turn = providers::llm()
            .converse(ConverseRequest {
                model: &model,
                system: system_prompt,
                messages: &messages,
                tools,
                max_tokens: RESPONSE_MAX_TOKENS,
            })
            .await?;

        messages.push(turn.message.clone());

        // Plain text response without tool use ends the loop; with no tool
        // results behind it there is nothing to cite.
        if turn.stop_reason != StopReason::ToolUse {
            return Ok(ReflectOutcome {
                answer: turn.message.text(),
                iterations: iteration + 1,
                tool_calls: std::mem::take(&mut ctx.tool_calls),
                ..Default::default()
            });
        }

        let tool_uses: Vec<(String, String, Value)> = turn
            .message
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();

        // A tool_use stop with no parseable tool blocks has nothing to
        // execute; treat the text as the final answer.
        if tool_uses.is_empty() {
            return Ok(ReflectOutcome {
                answer: turn.message.text(),
                iterations: iteration + 1,
                tool_calls: std::mem::take(&mut ctx.tool_calls),
                ..Default::default()
            });
        }

        let mut result_parts: Vec<ContentPart> = Vec::new();
        for (tool_use_id, tool_name, tool_input) in tool_uses {
            let tool_started = std::time::Instant::now();

            if tool_name == "done" {
                match try_finalize(ctx, &tool_input, iteration, max_iterations) {
                    DoneVerdict::Accepted(mut outcome) => {
                        outcome.iterations = iteration + 1;
                        outcome.tool_calls = std::mem::take(&mut ctx.tool_calls);
                        return Ok(outcome);
                    }
                    DoneVerdict::Rejected(reason) => {
                        warn!("[reflect] Finalization rejected: {reason}");
                        result_parts.push(ContentPart::ToolResult {
                            tool_use_id,
                            content: json!({"error": reason}).to_string(),
                        });
                        continue;
                    }
                }
            }

            let result = match dispatch_tool(ctx, &tool_name, &tool_input).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("[reflect] Tool {tool_name} failed: {e}");
                    json!({"error": format!("tool {tool_name} failed")})
                }
            };

            ctx.tool_calls.push(ReflectToolCall {
                tool: tool_name.clone(),
                iteration,
                elapsed_ms: tool_started.elapsed().as_millis() as u64,
            });

            result_parts.push(ContentPart::ToolResult {
                tool_use_id,
                content: result.to_string(),
            });
        }

        messages.push(ConverseMessage { role: ConverseRole::User, content: result_parts });
    }

    warn!("[reflect] Reached max iterations ({max_iterations}) for bank {}", ctx.bank_id);
    Ok(ReflectOutcome {
        answer: NO_CONFIDENT_ANSWER.to_string(),
        iterations: max_iterations,
        tool_calls: std::mem::take(&mut ctx.tool_calls),
        ..Default::default()
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// done: guardrails and citation validation
// ═══════════════════════════════════════════════════════════════════════════

enum DoneVerdict {
    Accepted(ReflectOutcome),
    Rejected(String),
}

fn try_finalize(
    ctx: &mut ReflectContext<'_>,
    input: &Value,
    iteration: u32,
    max_iterations: u32,
) -> DoneVerdict {
    let answer = input["answer"].as_str().unwrap_or("").trim().to_string();
    let cited: Vec<String> = input["cited_ids"]
        .as_array()
        .map(|items| {
            items.iter().filter_map(|v| v.as_str()).map(str::to_string).collect()
        })
        .unwrap_or_default();

    // Guardrail 1: strip ids no tool ever returned.
    let validated = validate_citations(
        &cited,
        &ctx.available_memory_ids,
        &ctx.available_observation_ids,
        &ctx.available_mental_model_ids,
    );
    if validated.stripped > 0 {
        warn!("[reflect] Stripped {} hallucinated ids from answer", validated.stripped);
    }

    let is_last_chance = iteration + 1 >= max_iterations;

    // Guardrail 2: a substantive answer with no surviving evidence is
    // rejected while iterations remain.
    if validated.all.is_empty()
        && answer.chars().count() > TRIVIAL_ANSWER_MAX_CHARS
        && !is_last_chance
    {
        let reason = if ctx.has_any_evidence() {
            "No valid evidence ids were cited. Cite ids returned by earlier tool calls, \
             or admit uncertainty briefly."
        } else {
            "No evidence has been gathered. Use search_mental_models, search_observations, \
             or recall to gather evidence before answering, or admit uncertainty briefly."
        };
        return DoneVerdict::Rejected(reason.to_string());
    }

    // Guardrail 3: directive post-check, one reminder retry.
    if !ctx.directives.is_empty() && !ctx.directive_retry_used && !is_last_chance {
        let compliance_ok = input["directive_compliance"]
            .as_array()
            .map(|items| !items.is_empty())
            .unwrap_or(false);
        if !compliance_ok {
            ctx.directive_retry_used = true;
            let reminder = directive::build_directives_reminder(&ctx.directives);
            return DoneVerdict::Rejected(format!(
                "The directive_compliance field is required: state how the answer honors \
                 each directive.\n{reminder}"
            ));
        }
    }

    DoneVerdict::Accepted(ReflectOutcome {
        answer,
        cited_ids: validated.all,
        memory_ids: validated.memory,
        observation_ids: validated.observations,
        mental_model_ids: validated.mental_models,
        ..Default::default()
    })
}

struct ValidatedCitations {
    all: Vec<Uuid>,
    memory: Vec<Uuid>,
    observations: Vec<Uuid>,
    mental_models: Vec<Uuid>,
    stripped: usize,
}

fn validate_citations(
    cited: &[String],
    memory_ids: &HashSet<Uuid>,
    observation_ids: &HashSet<Uuid>,
    mental_model_ids: &HashSet<Uuid>,
) -> ValidatedCitations {
    let mut validated = ValidatedCitations {
        all: Vec::new(),
        memory: Vec::new(),
        observations: Vec::new(),
        mental_models: Vec::new(),
        stripped: 0,
    };

    let mut seen: HashSet<Uuid> = HashSet::new();
    for raw in cited {
        let Ok(id) = Uuid::parse_str(raw.trim()) else {
            validated.stripped += 1;
            continue;
        };
        if !seen.insert(id) {
            continue;
        }
        if memory_ids.contains(&id) {
            validated.memory.push(id);
            validated.all.push(id);
        } else if observation_ids.contains(&id) {
            validated.observations.push(id);
            validated.all.push(id);
        } else if mental_model_ids.contains(&id) {
            validated.mental_models.push(id);
            validated.all.push(id);
        } else {
            validated.stripped += 1;
        }
    }
    validated
}

// ═══════════════════════════════════════════════════════════════════════════
// Tool dispatch
// ═══════════════════════════════════════════════════════════════════════════

async fn dispatch_tool(
    ctx: &mut ReflectContext<'_>,
    tool_name: &str,
    input: &Value,
) -> EngineResult<Value> {
    match tool_name {
        "search_mental_models" => tool_search_mental_models(ctx, input).await,
        "search_observations" => tool_search_observations(ctx, input).await,
        "recall" => tool_recall(ctx, input).await,
        "expand" => tool_expand(ctx, input).await,
        _ => Ok(json!({"error": format!("unknown tool: {tool_name}")})),
    }
}

fn clamp_max_results(input: &Value, default: usize, clamp: usize) -> usize {
    input["max_results"]
        .as_u64()
        .map(|v| v as usize)
        .unwrap_or(default)
        .clamp(1, clamp)
}

fn require_query(input: &Value) -> Result<&str, Value> {
    match input["query"].as_str().map(str::trim) {
        Some(q) if !q.is_empty() => Ok(q),
        _ => Err(json!({"error": "query is required", "results": []})),
    }
}

async fn tool_search_mental_models(
    ctx: &mut ReflectContext<'_>,
    input: &Value,
) -> EngineResult<Value> {
    let query = match require_query(input) {
        Ok(q) => q,
        Err(e) => return Ok(e),
    };
    let max_results =
        clamp_max_results(input, MENTAL_MODEL_SEARCH_DEFAULT, MENTAL_MODEL_SEARCH_CLAMP);

    let hits = mental_model::search_mental_models(
        ctx.pool,
        ctx.bank_id,
        query,
        ctx.tags.as_deref(),
        ctx.tags_match,
        max_results,
        &ctx.exclude_mental_model_ids,
    )
    .await?;

    let mut results = Vec::with_capacity(hits.len());
    for hit in &hits {
        ctx.available_mental_model_ids.insert(hit.model.id);
        let content = if hit.model.content.is_empty() {
            hit.model.description.clone().unwrap_or_default()
        } else {
            hit.model.content.clone()
        };
        results.push(json!({
            "id": hit.model.id,
            "name": hit.model.name,
            "content": content,
            "tags": hit.model.tags,
            "is_stale": hit.is_stale,
            "similarity": hit.similarity,
        }));
    }

    Ok(json!({"results": results, "total": results.len()}))
}

async fn tool_search_observations(
    ctx: &mut ReflectContext<'_>,
    input: &Value,
) -> EngineResult<Value> {
    let query = match require_query(input) {
        Ok(q) => q,
        Err(e) => return Ok(e),
    };
    let max_results =
        clamp_max_results(input, OBSERVATION_SEARCH_DEFAULT, OBSERVATION_SEARCH_CLAMP);

    // Tool-level tags narrow within the invocation-level tag scope.
    let tool_tags: Option<Vec<String>> = input["tags"].as_array().map(|items| {
        items.iter().filter_map(|v| v.as_str()).map(str::to_string).collect()
    });

    let query_embedding = embedder().embed_one(query).await?;
    let vector = Vector::from(query_embedding);

    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT id, text, proof_count, source_memory_ids, freshness_status, \
                1 - (embedding <=> ",
    );
    qb.push_bind(vector.clone());
    qb.push(") AS similarity FROM memory_units WHERE bank_id = ");
    qb.push_bind(ctx.bank_id);
    qb.push(" AND fact_type = 'observation' AND embedding IS NOT NULL AND (1 - (embedding <=> ");
    qb.push_bind(vector.clone());
    qb.push(")) >= ");
    qb.push_bind(SIMILARITY_THRESHOLD);
    if let Some(tags) = &ctx.tags {
        visibility::push_tags_predicate(&mut qb, tags, ctx.tags_match);
    }
    if let Some(tags) = &tool_tags {
        visibility::push_tags_predicate(&mut qb, tags, TagsMatch::Any);
    }
    qb.push(" ORDER BY embedding <=> ");
    qb.push_bind(vector);
    qb.push(" LIMIT ");
    qb.push_bind(max_results as i64);

    let rows = qb.build().fetch_all(ctx.pool).await?;
    let mut results = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: Uuid = row.get("id");
        ctx.available_observation_ids.insert(id);
        let source_ids: Vec<Uuid> = row.get("source_memory_ids");
        results.push(json!({
            "id": id,
            "text": row.get::<String, _>("text"),
            "proof_count": row.get::<i32, _>("proof_count"),
            "source_memory_ids": source_ids.iter().take(5).collect::<Vec<_>>(),
            "freshness_status": row.get::<Option<String>, _>("freshness_status")
                .unwrap_or_else(|| "unknown".to_string()),
            "similarity": row.get::<f64, _>("similarity"),
        }));
    }

    Ok(json!({"results": results, "total": results.len()}))
}

async fn tool_recall(ctx: &mut ReflectContext<'_>, input: &Value) -> EngineResult<Value> {
    let query = match require_query(input) {
        Ok(q) => q,
        Err(e) => return Ok(e),
    };
    let max_results = clamp_max_results(input, RECALL_SEARCH_DEFAULT, RECALL_SEARCH_CLAMP);

    let query_embedding = embedder().embed_one(query).await?;
    let vector = Vector::from(query_embedding);

    // Raw facts only; observations have their own tool.
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT id, text, fact_type, fact_kind, event_date, 1 - (embedding <=> ",
    );
    qb.push_bind(vector.clone());
    qb.push(") AS similarity FROM memory_units WHERE bank_id = ");
    qb.push_bind(ctx.bank_id);
    qb.push(
        " AND fact_type IN ('world', 'experience') AND embedding IS NOT NULL \
          AND (1 - (embedding <=> ",
    );
    qb.push_bind(vector.clone());
    qb.push(")) >= ");
    qb.push_bind(SIMILARITY_THRESHOLD);
    if let Some(tags) = &ctx.tags {
        visibility::push_tags_predicate(&mut qb, tags, ctx.tags_match);
    }
    qb.push(" ORDER BY embedding <=> ");
    qb.push_bind(vector);
    qb.push(" LIMIT ");
    qb.push_bind(max_results as i64);

    let rows = qb.build().fetch_all(ctx.pool).await?;
    let mut results = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: Uuid = row.get("id");
        ctx.available_memory_ids.insert(id);
        results.push(json!({
            "id": id,
            "text": row.get::<String, _>("text"),
            "fact_type": row.get::<String, _>("fact_type"),
            "fact_kind": row.get::<Option<String>, _>("fact_kind"),
            "event_date": row.get::<Option<chrono::DateTime<chrono::Utc>>, _>("event_date")
                .map(|d| d.to_rfc3339()),
            "similarity": row.get::<f64, _>("similarity"),
        }));
    }

    Ok(json!({"results": results, "total": results.len()}))
}

async fn tool_expand(ctx: &mut ReflectContext<'_>, input: &Value) -> EngineResult<Value> {
    let Some(unit_id) = input["unit_id"].as_str().and_then(|s| Uuid::parse_str(s.trim()).ok())
    else {
        return Ok(json!({"error": "unit_id must be a valid id"}));
    };

    // Bank scoping is the tenancy boundary: an id from another bank reads
    // as not found.
    let Some(row) = sqlx::query(
        "SELECT id, text, context, fact_type, fact_kind, event_date,
                who, what, when_description, where_description, why_description
         FROM memory_units
         WHERE id = $1 AND bank_id = $2",
    )
    .bind(unit_id)
    .bind(ctx.bank_id)
    .fetch_optional(ctx.pool)
    .await?
    else {
        return Ok(json!({"error": "memory unit not found"}));
    };

    let chunks = sqlx::query(
        "SELECT chunk_index, text
         FROM chunks
         WHERE memory_unit_id = $1 AND bank_id = $2
         ORDER BY chunk_index
         LIMIT $3",
    )
    .bind(unit_id)
    .bind(ctx.bank_id)
    .bind(EXPAND_CHUNK_LIMIT)
    .fetch_all(ctx.pool)
    .await?;

    let fact_type: String = row.get("fact_type");
    if fact_type == "observation" {
        ctx.available_observation_ids.insert(unit_id);
    } else {
        ctx.available_memory_ids.insert(unit_id);
    }

    let mut result = json!({
        "id": unit_id,
        "text": row.get::<String, _>("text"),
        "context": row.get::<Option<String>, _>("context"),
        "fact_type": fact_type,
        "who": row.get::<Option<Vec<String>>, _>("who").unwrap_or_default(),
        "what": row.get::<Option<String>, _>("what"),
        "when": row.get::<Option<String>, _>("when_description"),
        "where": row.get::<Option<String>, _>("where_description"),
        "why": row.get::<Option<String>, _>("why_description"),
    });

    if !chunks.is_empty() {
        result["chunks"] = Value::Array(
            chunks
                .iter()
                .map(|c| {
                    json!({
                        "index": c.get::<i32, _>("chunk_index"),
                        "text": c.get::<String, _>("text"),
                    })
                })
                .collect(),
        );
    }

    Ok(result)
}

// ═══════════════════════════════════════════════════════════════════════════
// Prompt & tool catalog
// ═══════════════════════════════════════════════════════════════════════════

fn build_system_prompt(
    disposition: &crate::atoms::types::Disposition,
    directives: &[String],
) -> String {
    let mut parts = Vec::new();

    // Directives lead (mandatory rules), disposition guides, base prompt,
    // then a trailing directive reminder for the recency effect.
    let section = directive::build_directives_section(directives);
    if !section.is_empty() {
        parts.push(section);
    }
    let stance = disposition::build_disposition_prompt(disposition);
    if !stance.is_empty() {
        parts.push(stance);
    }
    parts.push(REFLECT_SYSTEM_PROMPT.to_string());
    let reminder = directive::build_directives_reminder(directives);
    if !reminder.is_empty() {
        parts.push(reminder);
    }

    parts.join("\n")
}

fn build_tool_catalog(has_directives: bool) -> Vec<ToolSpec> {
    let mut done_properties = json!({
        "answer": {
            "type": "string",
            "description": "The final answer (markdown allowed). Never include ids here.",
        },
        "cited_ids": {
            "type": "array",
            "items": {"type": "string"},
            "description": "Ids of the mental models, observations, and raw facts the answer rests on.",
        },
    });
    let mut done_required = vec!["answer", "cited_ids"];
    if has_directives {
        done_properties["directive_compliance"] = json!({
            "type": "array",
            "items": {"type": "string"},
            "description": "For each directive, how the answer complies with it.",
        });
        done_required.push("directive_compliance");
    }

    vec![
        ToolSpec {
            name: "search_mental_models",
            description: "Search curated summaries (mental models). Highest-quality knowledge \
                          source; use this first.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query."},
                    "max_results": {"type": "integer", "description": "Maximum results (default 5, max 20)."},
                    "reason": {"type": "string", "description": "Why this call is needed."},
                },
                "required": ["query", "reason"],
            }),
        },
        ToolSpec {
            name: "search_observations",
            description: "Search consolidated knowledge (observations): durable patterns \
                          extracted from raw facts.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query."},
                    "max_results": {"type": "integer", "description": "Maximum results (default 20, max 50)."},
                    "tags": {"type": "array", "items": {"type": "string"},
                             "description": "Optional tag filter."},
                    "reason": {"type": "string", "description": "Why this call is needed."},
                },
                "required": ["query", "reason"],
            }),
        },
        ToolSpec {
            name: "recall",
            description: "Search raw facts (ground truth): the original memory text. Use for \
                          verification and detail. Observations are excluded.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query."},
                    "max_results": {"type": "integer", "description": "Maximum results (default 30, max 100)."},
                    "reason": {"type": "string", "description": "Why this call is needed."},
                },
                "required": ["query", "reason"],
            }),
        },
        ToolSpec {
            name: "expand",
            description: "Fetch the full context of one memory unit: complete text, \
                          who/what/when/where/why, and its chunks.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "unit_id": {"type": "string", "description": "Id of the memory unit to expand."},
                    "reason": {"type": "string", "description": "Why this call is needed."},
                },
                "required": ["unit_id", "reason"],
            }),
        },
        ToolSpec {
            name: "done",
            description: "Finalize: reasoning is complete and the answer is grounded. Call only \
                          after gathering sufficient evidence.",
            input_schema: json!({
                "type": "object",
                "properties": done_properties,
                "required": done_required,
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn sets() -> (HashSet<Uuid>, HashSet<Uuid>, HashSet<Uuid>) {
        (
            HashSet::from([id(1), id(2)]),
            HashSet::from([id(3)]),
            HashSet::from([id(4)]),
        )
    }

    #[test]
    fn test_validate_citations_strips_unknown() {
        let (mem, obs, mm) = sets();
        let cited = vec![
            id(1).to_string(),
            id(3).to_string(),
            id(4).to_string(),
            id(9).to_string(),   // never returned by a tool
            "garbage".to_string(),
        ];
        let v = validate_citations(&cited, &mem, &obs, &mm);
        assert_eq!(v.all.len(), 3);
        assert_eq!(v.memory, vec![id(1)]);
        assert_eq!(v.observations, vec![id(3)]);
        assert_eq!(v.mental_models, vec![id(4)]);
        assert_eq!(v.stripped, 2);
    }

    #[test]
    fn test_validate_citations_dedupes() {
        let (mem, obs, mm) = sets();
        let cited = vec![id(1).to_string(), id(1).to_string()];
        let v = validate_citations(&cited, &mem, &obs, &mm);
        assert_eq!(v.all, vec![id(1)]);
        assert_eq!(v.stripped, 0);
    }

    #[test]
    fn test_clamp_max_results() {
        assert_eq!(clamp_max_results(&json!({}), 20, 50), 20);
        assert_eq!(clamp_max_results(&json!({"max_results": 500}), 20, 50), 50);
        assert_eq!(clamp_max_results(&json!({"max_results": 7}), 20, 50), 7);
        assert_eq!(clamp_max_results(&json!({"max_results": 0}), 20, 50), 1);
    }

    #[test]
    fn test_tool_catalog_done_requires_compliance_only_with_directives() {
        let without = build_tool_catalog(false);
        let done = without.iter().find(|t| t.name == "done").unwrap();
        let required: Vec<&str> = done.input_schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(required, vec!["answer", "cited_ids"]);

        let with = build_tool_catalog(true);
        let done = with.iter().find(|t| t.name == "done").unwrap();
        assert!(done.input_schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "directive_compliance"));
    }

    #[test]
    fn test_catalog_is_the_fixed_five() {
        let names: Vec<&str> = build_tool_catalog(false).iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["search_mental_models", "search_observations", "recall", "expand", "done"]
        );
        // Bank id is never a tool parameter.
        for tool in build_tool_catalog(true) {
            let props = tool.input_schema["properties"].as_object().unwrap();
            assert!(!props.contains_key("bank_id"), "{} leaks bank_id", tool.name);
        }
    }

    fn make_ctx(pool: &PgPool) -> ReflectContext<'_> {
        ReflectContext {
            pool,
            bank_id: id(0),
            tags: None,
            tags_match: TagsMatch::Any,
            exclude_mental_model_ids: Vec::new(),
            directives: Vec::new(),
            available_memory_ids: HashSet::new(),
            available_observation_ids: HashSet::new(),
            available_mental_model_ids: HashSet::new(),
            tool_calls: Vec::new(),
            directive_retry_used: false,
        }
    }

    #[tokio::test]
    async fn test_done_guardrails() {
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let mut ctx = make_ctx(&pool);
        ctx.available_memory_ids.insert(id(1));

        // Substantive answer, hallucinated citation only -> rejected.
        let input = json!({
            "answer": "a".repeat(200),
            "cited_ids": [id(9).to_string()],
        });
        assert!(matches!(try_finalize(&mut ctx, &input, 0, 10), DoneVerdict::Rejected(_)));

        // Valid citation -> accepted.
        let input = json!({
            "answer": "a".repeat(200),
            "cited_ids": [id(1).to_string()],
        });
        match try_finalize(&mut ctx, &input, 0, 10) {
            DoneVerdict::Accepted(outcome) => {
                assert_eq!(outcome.cited_ids, vec![id(1)]);
                assert_eq!(outcome.memory_ids, vec![id(1)]);
            }
            DoneVerdict::Rejected(r) => panic!("should accept: {r}"),
        }

        // Short uncertainty admission without citations -> accepted.
        let input = json!({"answer": "I don't have enough information.", "cited_ids": []});
        assert!(matches!(try_finalize(&mut ctx, &input, 0, 10), DoneVerdict::Accepted(_)));
    }

    #[tokio::test]
    async fn test_directive_post_check_retries_once() {
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let mut ctx = make_ctx(&pool);
        ctx.directives = vec!["Answer in plain language.".to_string()];
        ctx.available_memory_ids.insert(id(1));

        let input = json!({
            "answer": "a".repeat(200),
            "cited_ids": [id(1).to_string()],
        });

        // First failure buys one reminder iteration.
        assert!(matches!(try_finalize(&mut ctx, &input, 0, 10), DoneVerdict::Rejected(_)));
        assert!(ctx.directive_retry_used);

        // Second failure passes through rather than looping forever.
        assert!(matches!(try_finalize(&mut ctx, &input, 1, 10), DoneVerdict::Accepted(_)));

        // A compliant call is accepted immediately.
        let mut ctx2 = make_ctx(&pool);
        ctx2.directives = vec!["Answer in plain language.".to_string()];
        ctx2.available_memory_ids.insert(id(1));
        let input = json!({
            "answer": "a".repeat(200),
            "cited_ids": [id(1).to_string()],
            "directive_compliance": ["Answer uses plain language."],
        });
        assert!(matches!(try_finalize(&mut ctx2, &input, 0, 10), DoneVerdict::Accepted(_)));
    }

    #[tokio::test]
    async fn test_last_iteration_accepts_uncited_answer() {
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let mut ctx = make_ctx(&pool);
        let input = json!({"answer": "a".repeat(200), "cited_ids": []});
        // On the final iteration the evidence guardrail yields to termination.
        assert!(matches!(try_finalize(&mut ctx, &input, 9, 10), DoneVerdict::Accepted(_)));
    }
}
