// ── Membank Engine: Cross-Encoder Reranker ─────────────────────────────────
// Optional relevance refinement over the fused recall candidates, against a
// Cohere-compatible /v1/rerank endpoint. Disabled unless RERANK_MODEL_ID is
// set; recall falls back to pure RRF ordering on any failure.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config;
use crate::engine::http::truncate_utf8;

/// Upper bound on candidates sent to the rerank API in one call.
pub const RERANK_CANDIDATE_LIMIT: usize = 300;

const REQUEST_TIMEOUT_SECS: u64 = 30;

static CLIENT: OnceLock<Client> = OnceLock::new();

fn client() -> &'static Client {
    CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default()
    })
}

/// Reranking runs only when both a model id and an endpoint are configured.
pub fn enabled() -> bool {
    config::rerank_model_id().is_some() && config::rerank_base_url().is_some()
}

/// Build the document text a cross-encoder scores. A leading date marker
/// improves its temporal awareness; context rides as a prefix.
pub fn build_rerank_document(
    text: &str,
    context: Option<&str>,
    event_date: Option<DateTime<Utc>>,
) -> String {
    let mut doc = text.to_string();
    if let Some(ctx) = context {
        if !ctx.is_empty() {
            doc = format!("{ctx}: {doc}");
        }
    }
    if let Some(date) = event_date {
        doc = format!("[Date: {}] {doc}", date.format("%Y-%m-%d"));
    }
    doc
}

/// Score `documents` against `query`. Returns (original index, relevance)
/// pairs in relevance order.
pub async fn rerank(query: &str, documents: &[String]) -> EngineResult<Vec<(usize, f64)>> {
    if documents.is_empty() {
        return Ok(Vec::new());
    }

    let model = config::rerank_model_id()
        .ok_or_else(|| EngineError::Config("RERANK_MODEL_ID is not set".into()))?;
    let base_url = config::rerank_base_url()
        .ok_or_else(|| EngineError::Config("RERANK_BASE_URL is not set".into()))?;

    let url = format!("{}/v1/rerank", base_url.trim_end_matches('/'));
    let body = json!({
        "model": model,
        "query": query,
        "documents": documents,
        "top_n": documents.len(),
    });

    let mut req = client().post(&url).json(&body);
    if let Some(key) = config::rerank_api_key() {
        req = req.header("Authorization", format!("Bearer {key}"));
    }

    let response = req.send().await.map_err(|e| {
        EngineError::provider("rerank", format!("transport: {e}"))
    })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body_text = response.text().await.unwrap_or_default();
        return Err(EngineError::provider(
            "rerank",
            format!("API error {}: {}", status, truncate_utf8(&body_text, 200)),
        ));
    }

    let v: Value = response.json().await?;
    parse_rerank_response(&v, documents.len())
}

/// Parse `{results: [{index, relevance_score}]}`, dropping out-of-range
/// indexes rather than erroring.
fn parse_rerank_response(v: &Value, document_count: usize) -> EngineResult<Vec<(usize, f64)>> {
    let results = v["results"]
        .as_array()
        .ok_or_else(|| EngineError::provider("rerank", "no results array in response"))?;

    let mut scored = Vec::with_capacity(results.len());
    for entry in results {
        let index = entry["index"].as_u64().map(|i| i as usize);
        let score = entry["relevance_score"].as_f64();
        if let (Some(index), Some(score)) = (index, score) {
            if index < document_count {
                scored.push((index, score));
            }
        }
    }
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_document_building() {
        let date = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(
            build_rerank_document("Alice joined Acme.", Some("standup"), Some(date)),
            "[Date: 2024-06-01] standup: Alice joined Acme."
        );
        assert_eq!(build_rerank_document("plain", None, None), "plain");
        assert_eq!(build_rerank_document("plain", Some(""), None), "plain");
    }

    #[test]
    fn test_parse_rerank_response() {
        let v = serde_json::json!({
            "results": [
                {"index": 1, "relevance_score": 0.91},
                {"index": 0, "relevance_score": 0.4},
                {"index": 99, "relevance_score": 0.9},
                {"index": 2},
            ]
        });
        let scored = parse_rerank_response(&v, 3).unwrap();
        assert_eq!(scored, vec![(1, 0.91), (0, 0.4)]);
    }

    #[test]
    fn test_parse_rerank_response_missing_results() {
        assert!(parse_rerank_response(&serde_json::json!({}), 3).is_err());
    }
}
