// ── Membank Engine: Observation Freshness ──────────────────────────────────
// Classifies each observation by the time distribution of its evidence,
// recomputed after every consolidation run that processed facts.
//
//   recent_density = evidence in the last 30 days / 30
//   older_density  = earlier evidence / (total span - 30)
//   ratio = recent_density / older_density
//
//   NEW            all evidence within 30 days
//   STRENGTHENING  ratio > 1.5
//   STABLE         0.5 <= ratio <= 1.5
//   WEAKENING      ratio < 0.5
//   STALE          no evidence in the last 30 days

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::info;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::atoms::error::EngineResult;
use crate::atoms::types::FreshnessStatus;

const RECENT_DAYS: i64 = 30;

/// Classify one observation from its evidence timestamps.
pub fn compute_freshness(
    evidence_timestamps: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> FreshnessStatus {
    if evidence_timestamps.is_empty() {
        return FreshnessStatus::Stale;
    }

    let recent_cutoff = now - Duration::days(RECENT_DAYS);
    let recent: Vec<_> = evidence_timestamps.iter().filter(|ts| **ts > recent_cutoff).collect();
    let older: Vec<_> = evidence_timestamps.iter().filter(|ts| **ts <= recent_cutoff).collect();

    if recent.is_empty() {
        return FreshnessStatus::Stale;
    }
    if older.is_empty() {
        return FreshnessStatus::New;
    }

    let recent_density = recent.len() as f64 / RECENT_DAYS as f64;

    let earliest = evidence_timestamps.iter().min().unwrap();
    let total_span_days = ((now - *earliest).num_seconds() as f64 / 86_400.0).max(1.0);
    let older_period = (total_span_days - RECENT_DAYS as f64).max(1.0);
    let older_density = older.len() as f64 / older_period;

    if older_density == 0.0 {
        return FreshnessStatus::New;
    }

    let ratio = recent_density / older_density;
    if ratio > 1.5 {
        FreshnessStatus::Strengthening
    } else if ratio < 0.5 {
        FreshnessStatus::Weakening
    } else {
        FreshnessStatus::Stable
    }
}

/// Recompute freshness for every observation in a bank. Two reads, one
/// in-memory pass, one batched write per status change.
pub async fn update_freshness_for_bank(pool: &PgPool, bank_id: Uuid) -> EngineResult<usize> {
    let observations = sqlx::query(
        "SELECT id, source_memory_ids
         FROM memory_units
         WHERE bank_id = $1 AND fact_type = 'observation'",
    )
    .bind(bank_id)
    .fetch_all(pool)
    .await?;

    if observations.is_empty() {
        return Ok(0);
    }

    let mut all_source_ids: Vec<Uuid> = Vec::new();
    for row in &observations {
        let ids: Vec<Uuid> = row.get("source_memory_ids");
        all_source_ids.extend(ids);
    }
    all_source_ids.sort();
    all_source_ids.dedup();

    let mut source_timestamps: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    if !all_source_ids.is_empty() {
        let rows = sqlx::query(
            "SELECT id, created_at FROM memory_units WHERE id = ANY($1) AND bank_id = $2",
        )
        .bind(&all_source_ids)
        .bind(bank_id)
        .fetch_all(pool)
        .await?;
        for row in rows {
            source_timestamps.insert(row.get("id"), row.get("created_at"));
        }
    }

    let now = Utc::now();
    let mut updated = 0usize;
    for row in &observations {
        let observation_id: Uuid = row.get("id");
        let source_ids: Vec<Uuid> = row.get("source_memory_ids");
        let evidence: Vec<DateTime<Utc>> = source_ids
            .iter()
            .filter_map(|sid| source_timestamps.get(sid).copied())
            .collect();

        let status = compute_freshness(&evidence, now);
        sqlx::query("UPDATE memory_units SET freshness_status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(observation_id)
            .execute(pool)
            .await?;
        updated += 1;
    }

    info!("[freshness] Updated {} observations for bank {}", updated, bank_id);
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn days_ago(n: i64) -> DateTime<Utc> {
        now() - Duration::days(n)
    }

    #[test]
    fn test_no_evidence_is_stale() {
        assert_eq!(compute_freshness(&[], now()), FreshnessStatus::Stale);
    }

    #[test]
    fn test_all_recent_is_new() {
        let evidence = vec![days_ago(1), days_ago(5), days_ago(29)];
        assert_eq!(compute_freshness(&evidence, now()), FreshnessStatus::New);
    }

    #[test]
    fn test_no_recent_is_stale() {
        let evidence = vec![days_ago(40), days_ago(90)];
        assert_eq!(compute_freshness(&evidence, now()), FreshnessStatus::Stale);
    }

    #[test]
    fn test_strengthening() {
        // 5 recent over 30 days vs 1 older over ~60 days.
        let mut evidence: Vec<_> = (1..=5).map(days_ago).collect();
        evidence.push(days_ago(90));
        assert_eq!(compute_freshness(&evidence, now()), FreshnessStatus::Strengthening);
    }

    #[test]
    fn test_weakening() {
        // 1 recent vs dense older history.
        let mut evidence = vec![days_ago(10)];
        evidence.extend((31..=80).map(days_ago));
        assert_eq!(compute_freshness(&evidence, now()), FreshnessStatus::Weakening);
    }

    #[test]
    fn test_stable() {
        // Similar densities either side of the cutoff.
        let mut evidence: Vec<_> = (1..=30).step_by(10).map(days_ago).collect();
        evidence.extend((31..=61).step_by(10).map(days_ago));
        assert_eq!(compute_freshness(&evidence, now()), FreshnessStatus::Stable);
    }
}
