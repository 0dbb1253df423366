// ── Membank Engine: Configuration ──────────────────────────────────────────
// Every tunable is resolved through an accessor function at call time, never
// at module load. This keeps behavior independent of import order and lets a
// late `.env` load (the CLI calls dotenvy before anything else) still win.

use std::env;

use crate::atoms::error::{EngineError, EngineResult};

// ── Defaults ───────────────────────────────────────────────────────────────

const DEFAULT_EXTRACTION_MODEL: &str = "claude-haiku-4-5";
const DEFAULT_CONSOLIDATION_MODEL: &str = "claude-haiku-4-5";
const DEFAULT_REFLECT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-large";

const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_EMBEDDING_BASE_URL: &str = "https://api.openai.com";

const DEFAULT_CONSOLIDATION_INTERVAL_SECS: u64 = 300;
/// Floor below which the scheduler interval is clamped.
const MIN_CONSOLIDATION_INTERVAL_SECS: u64 = 10;

// ── Required settings ──────────────────────────────────────────────────────

/// PostgreSQL connection string. Required; missing is a configuration error.
pub fn database_url() -> EngineResult<String> {
    env::var("DATABASE_URL")
        .map_err(|_| EngineError::Config("DATABASE_URL environment variable is not set".into()))
}

/// API key for the Anthropic-compatible LLM endpoint.
pub fn anthropic_api_key() -> EngineResult<String> {
    env::var("ANTHROPIC_API_KEY")
        .map_err(|_| EngineError::Config("ANTHROPIC_API_KEY environment variable is not set".into()))
}

// ── Model identifiers (lazy, overridable) ──────────────────────────────────

pub fn extraction_model_id() -> String {
    env::var("EXTRACTION_MODEL_ID").unwrap_or_else(|_| DEFAULT_EXTRACTION_MODEL.to_string())
}

pub fn consolidation_model_id() -> String {
    env::var("CONSOLIDATION_MODEL_ID").unwrap_or_else(|_| DEFAULT_CONSOLIDATION_MODEL.to_string())
}

pub fn reflect_model_id() -> String {
    env::var("REFLECT_MODEL_ID").unwrap_or_else(|_| DEFAULT_REFLECT_MODEL.to_string())
}

pub fn embedding_model_id() -> String {
    env::var("EMBEDDING_MODEL_ID").unwrap_or_else(|_| DEFAULT_EMBEDDING_MODEL.to_string())
}

/// Rerank model. Unset means the rerank stage is skipped and recall ordering
/// is pure RRF.
pub fn rerank_model_id() -> Option<String> {
    env::var("RERANK_MODEL_ID").ok().filter(|v| !v.trim().is_empty())
}

// ── Endpoints ──────────────────────────────────────────────────────────────

pub fn anthropic_base_url() -> String {
    env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_ANTHROPIC_BASE_URL.to_string())
}

pub fn embedding_base_url() -> String {
    env::var("EMBEDDING_BASE_URL").unwrap_or_else(|_| DEFAULT_EMBEDDING_BASE_URL.to_string())
}

pub fn embedding_api_key() -> Option<String> {
    env::var("EMBEDDING_API_KEY").ok().filter(|v| !v.is_empty())
}

/// Base URL of the rerank service (Cohere-compatible /v1/rerank).
pub fn rerank_base_url() -> Option<String> {
    env::var("RERANK_BASE_URL").ok().filter(|v| !v.is_empty())
}

/// Rerank credential; falls back to the embedding key when unset.
pub fn rerank_api_key() -> Option<String> {
    env::var("RERANK_API_KEY")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(embedding_api_key)
}

// ── Scheduler ──────────────────────────────────────────────────────────────

/// Consolidation tick interval in seconds, clamped to a 10 s floor. Invalid
/// values fall back to the default rather than aborting startup.
pub fn consolidation_interval_secs() -> u64 {
    let raw = env::var("CONSOLIDATION_INTERVAL_SECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_CONSOLIDATION_INTERVAL_SECS);
    raw.max(MIN_CONSOLIDATION_INTERVAL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each test uses its own variable or
    // restores what it touched, and the interval tests run on one variable
    // sequentially within a single test body to avoid cross-test races.
    #[test]
    fn test_interval_clamping_and_fallback() {
        env::remove_var("CONSOLIDATION_INTERVAL_SECONDS");
        assert_eq!(consolidation_interval_secs(), 300);

        env::set_var("CONSOLIDATION_INTERVAL_SECONDS", "3");
        assert_eq!(consolidation_interval_secs(), 10);

        env::set_var("CONSOLIDATION_INTERVAL_SECONDS", "nonsense");
        assert_eq!(consolidation_interval_secs(), 300);

        env::set_var("CONSOLIDATION_INTERVAL_SECONDS", "45");
        assert_eq!(consolidation_interval_secs(), 45);

        env::remove_var("CONSOLIDATION_INTERVAL_SECONDS");
    }

    #[test]
    fn test_rerank_model_blank_means_disabled() {
        env::set_var("RERANK_MODEL_ID", "   ");
        assert_eq!(rerank_model_id(), None);
        env::set_var("RERANK_MODEL_ID", "rerank-english-v3.0");
        assert_eq!(rerank_model_id().as_deref(), Some("rerank-english-v3.0"));
        env::remove_var("RERANK_MODEL_ID");
    }
}
