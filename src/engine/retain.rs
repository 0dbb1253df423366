// ── Membank Engine: Retain Pipeline ────────────────────────────────────────
// Extract → embed → dedup → persist for one conversational turn.
//
// Ordering: fact insert order follows LLM extraction order. Everything that
// writes (unit, entities, associations, chunks) shares one transaction, so a
// failure partway leaves nothing behind. Graph links are built after commit,
// best-effort; a link failure never unwinds stored facts.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use log::{debug, info, warn};
use pgvector::Vector;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ExtractedFact, FactKind, RetainOutcome};
use crate::engine::chunking;
use crate::engine::embedding::embedder;
use crate::engine::entity;
use crate::engine::extraction::{self, MAX_CONTENT_LENGTH};
use crate::engine::graph;

pub const MAX_CONTEXT_LENGTH: usize = 2_000;

/// Cosine similarity at or above which a fact is considered a duplicate.
const DUPLICATE_SIMILARITY_THRESHOLD: f32 = 0.9;

/// Events dedup within aligned windows of this many hours around event_date.
const DUPLICATE_BUCKET_HOURS: u32 = 12;

/// Conversation facts dedup against units stored within this many days.
const CONVERSATION_DEDUP_WINDOW_DAYS: i64 = 7;

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

/// Run the Retain pipeline for one turn. Returns the ids actually stored and
/// the ids of existing units that suppressed duplicates.
pub async fn retain(
    pool: &PgPool,
    bank_id: Uuid,
    content: &str,
    context: &str,
) -> EngineResult<RetainOutcome> {
    validate_input(content, context)?;

    let mission = load_mission(pool, bank_id).await?;

    // 1. Extraction (LLM).
    let facts = extraction::extract_facts(content, context, &mission).await?;
    if facts.is_empty() {
        return Ok(RetainOutcome::default());
    }

    // 2. Embeddings, order-preserving, outside the transaction.
    let embedding_texts: Vec<String> = facts.iter().map(build_embedding_text).collect();
    let embeddings = embedder().embed(&embedding_texts).await?;

    // Pre-chunk long fact texts and embed the chunks up front too.
    let mut fact_chunks: Vec<Vec<(String, Vec<f32>)>> = Vec::with_capacity(facts.len());
    for fact in &facts {
        let pieces = chunking::split_into_chunks(&fact.text);
        if pieces.is_empty() {
            fact_chunks.push(Vec::new());
            continue;
        }
        let vectors = embedder().embed(&pieces).await?;
        fact_chunks.push(pieces.into_iter().zip(vectors).collect());
    }

    // 3. Dedup + persist, atomically.
    let mut outcome = RetainOutcome::default();
    let mut stored_embeddings: Vec<Vec<f32>> = Vec::new();

    let mut tx = pool.begin().await?;
    for ((fact, embedding), chunks) in facts.iter().zip(&embeddings).zip(&fact_chunks) {
        match find_duplicate(&mut tx, bank_id, fact, embedding).await? {
            Some(existing_id) => {
                debug!("[retain] Duplicate suppressed by {}: {}", existing_id, fact.text);
                outcome.deduped.push(existing_id);
            }
            None => {
                let unit_id =
                    insert_unit(&mut tx, bank_id, fact, embedding, context, chunks).await?;
                outcome.stored.push(unit_id);
                stored_embeddings.push(embedding.clone());
            }
        }
    }
    tx.commit().await?;

    // 4. Graph maintenance outside the write transaction, best-effort.
    if !outcome.stored.is_empty() {
        if let Err(e) =
            graph::build_links_for_units(pool, bank_id, &outcome.stored, &stored_embeddings).await
        {
            warn!("[retain] Link building failed (facts are stored): {e}");
        }
    }

    info!(
        "[retain] Complete for bank {}: stored={}, deduped={}",
        bank_id,
        outcome.stored.len(),
        outcome.deduped.len()
    );
    Ok(outcome)
}

// ═══════════════════════════════════════════════════════════════════════════
// Validation & helpers
// ═══════════════════════════════════════════════════════════════════════════

fn validate_input(content: &str, context: &str) -> EngineResult<()> {
    if content.trim().is_empty() {
        return Err(EngineError::invalid("content is required"));
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(EngineError::invalid(format!(
            "content exceeds maximum length of {MAX_CONTENT_LENGTH}"
        )));
    }
    if context.chars().count() > MAX_CONTEXT_LENGTH {
        return Err(EngineError::invalid(format!(
            "context exceeds maximum length of {MAX_CONTEXT_LENGTH}"
        )));
    }
    Ok(())
}

async fn load_mission(pool: &PgPool, bank_id: Uuid) -> EngineResult<String> {
    let row = sqlx::query("SELECT mission FROM banks WHERE id = $1")
        .bind(bank_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(row.get::<String, _>("mission")),
        None => Err(EngineError::invalid("unknown bank")),
    }
}

/// Embedding text is the fact text augmented with its date so temporally
/// distinct but similarly-worded events stay separable in vector space.
fn build_embedding_text(fact: &ExtractedFact) -> String {
    match fact.event_date {
        Some(date) => format!("{} (happened on {})", fact.text, date.format("%Y-%m-%d")),
        None => fact.text.clone(),
    }
}

/// Align a timestamp down to its 12-hour bucket boundary.
fn bucket_start(date: DateTime<Utc>) -> DateTime<Utc> {
    let aligned_hour = (date.hour() / DUPLICATE_BUCKET_HOURS) * DUPLICATE_BUCKET_HOURS;
    Utc.with_ymd_and_hms(
        date.date_naive().year(),
        date.date_naive().month(),
        date.date_naive().day(),
        aligned_hour,
        0,
        0,
    )
    .single()
    .unwrap_or(date)
}

/// True when two facts plausibly describe the same thing: their `who` lists
/// intersect case-insensitively, or their `what` fields subsume one another.
fn who_what_overlap(
    fact_who: &[String],
    fact_what: Option<&str>,
    row_who: &[String],
    row_what: Option<&str>,
) -> bool {
    let fact_set: std::collections::HashSet<String> =
        fact_who.iter().map(|w| w.trim().to_lowercase()).collect();
    if row_who.iter().any(|w| fact_set.contains(&w.trim().to_lowercase())) {
        return true;
    }

    match (fact_what, row_what) {
        (Some(a), Some(b)) => {
            let a = a.trim().to_lowercase();
            let b = b.trim().to_lowercase();
            !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
        }
        _ => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Duplicate detection
// ═══════════════════════════════════════════════════════════════════════════

async fn find_duplicate(
    conn: &mut PgConnection,
    bank_id: Uuid,
    fact: &ExtractedFact,
    embedding: &[f32],
) -> EngineResult<Option<Uuid>> {
    match (fact.fact_kind, fact.event_date) {
        (FactKind::Event, event_date) => {
            let anchor = event_date.unwrap_or_else(Utc::now);
            find_duplicate_event(conn, bank_id, fact, embedding, anchor).await
        }
        (FactKind::Conversation, _) => {
            find_duplicate_conversation(conn, bank_id, embedding).await
        }
    }
}

/// Event dedup: same aligned 12-hour bucket, cosine >= 0.9, and the spec's
/// who/what overlap requirement.
async fn find_duplicate_event(
    conn: &mut PgConnection,
    bank_id: Uuid,
    fact: &ExtractedFact,
    embedding: &[f32],
    anchor: DateTime<Utc>,
) -> EngineResult<Option<Uuid>> {
    let start = bucket_start(anchor);
    let end = start + Duration::hours(DUPLICATE_BUCKET_HOURS as i64);

    let rows = sqlx::query(
        "SELECT id, who, what, 1 - (embedding <=> $1) AS similarity
         FROM memory_units
         WHERE bank_id = $2
           AND event_date >= $3
           AND event_date < $4
           AND embedding IS NOT NULL
           AND (1 - (embedding <=> $1)) >= $5
         ORDER BY embedding <=> $1
         LIMIT 5",
    )
    .bind(Vector::from(embedding.to_vec()))
    .bind(bank_id)
    .bind(start)
    .bind(end)
    .bind(DUPLICATE_SIMILARITY_THRESHOLD as f64)
    .fetch_all(&mut *conn)
    .await?;

    for row in rows {
        let row_who: Option<Vec<String>> = row.get("who");
        let row_what: Option<String> = row.get("what");
        if who_what_overlap(
            &fact.who,
            fact.what.as_deref(),
            &row_who.unwrap_or_default(),
            row_what.as_deref(),
        ) {
            return Ok(Some(row.get("id")));
        }
    }
    Ok(None)
}

/// Conversation dedup: cosine >= 0.9 against any recent conversation unit.
async fn find_duplicate_conversation(
    conn: &mut PgConnection,
    bank_id: Uuid,
    embedding: &[f32],
) -> EngineResult<Option<Uuid>> {
    let cutoff = Utc::now() - Duration::days(CONVERSATION_DEDUP_WINDOW_DAYS);

    let row = sqlx::query(
        "SELECT id
         FROM memory_units
         WHERE bank_id = $1
           AND fact_kind = 'conversation'
           AND created_at >= $2
           AND embedding IS NOT NULL
           AND (1 - (embedding <=> $3)) >= $4
         LIMIT 1",
    )
    .bind(bank_id)
    .bind(cutoff)
    .bind(Vector::from(embedding.to_vec()))
    .bind(DUPLICATE_SIMILARITY_THRESHOLD as f64)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|r| r.get("id")))
}

// ═══════════════════════════════════════════════════════════════════════════
// Persistence
// ═══════════════════════════════════════════════════════════════════════════

async fn insert_unit(
    conn: &mut PgConnection,
    bank_id: Uuid,
    fact: &ExtractedFact,
    embedding: &[f32],
    context: &str,
    chunks: &[(String, Vec<f32>)],
) -> EngineResult<Uuid> {
    let row = sqlx::query(
        "INSERT INTO memory_units (
             bank_id, text, context, embedding,
             fact_type, fact_kind,
             what, who, when_description, where_description, why_description,
             event_date, occurred_start, occurred_end, mentioned_at
         ) VALUES (
             $1, $2, $3, $4,
             $5, $6,
             $7, $8, $9, $10, $11,
             $12, $13, $14, NOW()
         )
         RETURNING id",
    )
    .bind(bank_id)
    .bind(&fact.text)
    .bind(if context.is_empty() { None } else { Some(context) })
    .bind(Vector::from(embedding.to_vec()))
    .bind(fact.fact_type.as_str())
    .bind(fact.fact_kind.as_str())
    .bind(&fact.what)
    .bind(if fact.who.is_empty() { None } else { Some(&fact.who) })
    .bind(&fact.when_description)
    .bind(&fact.where_description)
    .bind(&fact.why_description)
    .bind(fact.event_date)
    .bind(fact.occurred_start)
    .bind(fact.occurred_end)
    .fetch_one(&mut *conn)
    .await?;

    let unit_id: Uuid = row.get("id");

    // Resolve participants and link them, inside this same transaction.
    if !fact.who.is_empty() {
        let entities = entity::resolve_many(&mut *conn, bank_id, &fact.who, None).await?;
        for resolved in &entities {
            sqlx::query(
                "INSERT INTO unit_entities (unit_id, entity_id)
                 VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(unit_id)
            .bind(resolved.id)
            .execute(&mut *conn)
            .await?;
        }
    }

    for (index, (chunk_text, chunk_embedding)) in chunks.iter().enumerate() {
        sqlx::query(
            "INSERT INTO chunks (bank_id, memory_unit_id, chunk_index, text, embedding)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(bank_id)
        .bind(unit_id)
        .bind(index as i32)
        .bind(chunk_text)
        .bind(Vector::from(chunk_embedding.clone()))
        .execute(&mut *conn)
        .await?;
    }

    Ok(unit_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_input_bounds() {
        assert!(validate_input("hello", "").is_ok());
        assert!(matches!(validate_input("  ", ""), Err(EngineError::InvalidInput(_))));
        let long = "x".repeat(MAX_CONTENT_LENGTH + 1);
        assert!(validate_input(&long, "").is_err());
        let long_ctx = "c".repeat(MAX_CONTEXT_LENGTH + 1);
        assert!(validate_input("hello", &long_ctx).is_err());
    }

    #[test]
    fn test_bucket_alignment() {
        let d = Utc.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap();
        assert_eq!(bucket_start(d), Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());

        let early = Utc.with_ymd_and_hms(2024, 6, 1, 3, 5, 0).unwrap();
        assert_eq!(bucket_start(early), Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_embedding_text_date_augmentation() {
        let mut fact = sample_fact();
        fact.event_date = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(
            build_embedding_text(&fact),
            "Alice joined Acme. (happened on 2024-06-01)"
        );
        fact.event_date = None;
        assert_eq!(build_embedding_text(&fact), "Alice joined Acme.");
    }

    #[test]
    fn test_who_what_overlap() {
        let who = vec!["Alice".to_string()];
        assert!(who_what_overlap(&who, None, &["alice".to_string()], None));
        assert!(!who_what_overlap(&who, None, &["Bob".to_string()], None));
        assert!(who_what_overlap(
            &[],
            Some("joined Acme as engineer"),
            &[],
            Some("joined acme")
        ));
        assert!(!who_what_overlap(&[], Some("joined Acme"), &[], Some("left Initech")));
        assert!(!who_what_overlap(&[], None, &[], None));
    }

    fn sample_fact() -> ExtractedFact {
        ExtractedFact {
            text: "Alice joined Acme.".into(),
            what: Some("joined Acme".into()),
            who: vec!["Alice".into()],
            when_description: None,
            where_description: None,
            why_description: None,
            event_date: None,
            occurred_start: None,
            occurred_end: None,
            fact_kind: FactKind::Event,
            fact_type: crate::atoms::types::FactType::World,
        }
    }
}
