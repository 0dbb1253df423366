// ── Membank Engine: Embedding Client ───────────────────────────────────────
// Calls an OpenAI-compatible /v1/embeddings endpoint to produce the fixed
// 1024-dimensional vectors every search path depends on.
//
// Contract:
//   • `embed(texts)` preserves input order in its output.
//   • A process-wide semaphore caps in-flight requests at 5.
//   • Empty input strings fail loudly; a zero vector indexed into HNSW would
//     silently poison neighbor results.

use std::sync::OnceLock;

use futures::future::try_join_all;
use log::warn;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config;
use crate::engine::http::{is_retryable_status, retry_delay, truncate_utf8, MAX_RETRIES};

/// Fixed vector width. The `vector(1024)` columns and every HNSW index
/// assume this; a provider returning anything else is an error.
pub const EMBEDDING_DIMENSIONS: usize = 1024;

/// Input cap with safety margin for 8k-token embedding models.
const MAX_INPUT_CHARS: usize = 24_000;

/// Process-wide concurrency cap on embedding requests.
const EMBEDDING_CONCURRENCY: usize = 5;

const REQUEST_TIMEOUT_SECS: u64 = 60;

static EMBEDDING_SEMAPHORE: OnceLock<Semaphore> = OnceLock::new();
static EMBEDDING_CLIENT: OnceLock<EmbeddingClient> = OnceLock::new();

fn semaphore() -> &'static Semaphore {
    EMBEDDING_SEMAPHORE.get_or_init(|| Semaphore::new(EMBEDDING_CONCURRENCY))
}

/// The process-wide embedding client.
pub fn embedder() -> &'static EmbeddingClient {
    EMBEDDING_CLIENT.get_or_init(EmbeddingClient::from_env)
}

pub struct EmbeddingClient {
    client: Client,
    base_url: String,
}

impl EmbeddingClient {
    fn from_env() -> Self {
        EmbeddingClient {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            base_url: config::embedding_base_url(),
        }
    }

    /// Embed one text. Suspends on the process-wide concurrency cap.
    pub async fn embed_one(&self, text: &str) -> EngineResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EngineError::invalid("cannot embed an empty string"));
        }

        let _permit = semaphore().acquire().await.map_err(|_| {
            EngineError::provider("embedding", "concurrency semaphore closed")
        })?;

        let input = if text.len() > MAX_INPUT_CHARS {
            warn!(
                "[embedding] Text truncated for embedding: {} -> {} chars",
                text.len(),
                MAX_INPUT_CHARS
            );
            truncate_utf8(text, MAX_INPUT_CHARS)
        } else {
            text
        };

        self.call_api(input).await
    }

    /// Embed a batch, preserving input order. Requests fan out concurrently
    /// under the shared cap; the first failure aborts the whole batch.
    pub async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let futures = texts.iter().map(|t| self.embed_one(t));
        try_join_all(futures).await
    }

    /// POST /v1/embeddings { model, input, dimensions } with retry.
    async fn call_api(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": config::embedding_model_id(),
            "input": text,
            "dimensions": EMBEDDING_DIMENSIONS,
        });

        let mut last_error = String::new();
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                retry_delay(attempt - 1, None).await;
            }

            let mut req = self.client.post(&url).json(&body);
            if let Some(key) = config::embedding_api_key() {
                req = req.header("Authorization", format!("Bearer {key}"));
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("transport: {e}");
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(EngineError::provider("embedding", last_error));
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("API error {}: {}", status, truncate_utf8(&body_text, 200));
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(EngineError::provider("embedding", last_error));
            }

            let v: Value = response.json().await?;
            return parse_embedding_response(&v);
        }

        Err(EngineError::provider("embedding", last_error))
    }
}

/// Extract `data[0].embedding` and enforce the fixed width.
fn parse_embedding_response(v: &Value) -> EngineResult<Vec<f32>> {
    let embedding = v["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| EngineError::provider("embedding", "no data[0].embedding in response"))?;

    let vector: Vec<f32> = embedding
        .iter()
        .filter_map(|x| x.as_f64().map(|f| f as f32))
        .collect();

    if vector.len() != EMBEDDING_DIMENSIONS {
        return Err(EngineError::provider(
            "embedding",
            format!("expected {} dimensions, got {}", EMBEDDING_DIMENSIONS, vector.len()),
        ));
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedding_response_checks_width() {
        let ok = json!({"data": [{"embedding": vec![0.5f32; EMBEDDING_DIMENSIONS]}]});
        assert_eq!(parse_embedding_response(&ok).unwrap().len(), EMBEDDING_DIMENSIONS);

        let short = json!({"data": [{"embedding": [0.1, 0.2]}]});
        assert!(parse_embedding_response(&short).is_err());

        let missing = json!({"data": []});
        assert!(parse_embedding_response(&missing).is_err());
    }

    #[tokio::test]
    async fn test_embed_rejects_empty_string() {
        let client = EmbeddingClient {
            client: Client::new(),
            base_url: "http://localhost:0".into(),
        };
        let err = client.embed_one("   ").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
