// ── Membank Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by failure class (invalid input, upstream
//     provider, concurrency conflict, guardrail, timeout, fatal) plus the
//     infrastructure conversions (`#[from]`) callers rely on with `?`.
//   • Caller-visible messages never carry raw model output, stack traces,
//     or ids outside the caller's bank.
//   • No variant carries secret material (API keys, connection strings).

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-supplied input is malformed: bank id not UUID-shaped, text
    /// empty or over its length bound, unknown fact type. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An LLM or embedding provider call failed. Retain/Reflect fail fast
    /// on this; consolidation logs it and moves to the next fact.
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Unique-index race lost to a concurrent writer. Recoverable: the
    /// loser reloads and returns the winner's row.
    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    /// A Reflect finalization was rejected (citations stripped to nothing,
    /// or the directive post-check failed).
    #[error("Guardrail rejected: {0}")]
    Guardrail(String),

    /// Wall-clock budget exceeded.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invariant violation that should abort the process (e.g. a cascade
    /// delete left an orphan). Operational alert, never swallowed.
    #[error("Fatal invariant violation: {0}")]
    Fatal(String),

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL / sqlx failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a provider error with name and message.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Create an invalid-input error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// True when the underlying database error is a unique-index violation
    /// (SQLSTATE 23505), the signature of a lost insert race.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            EngineError::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_do_not_leak_detail_prefix() {
        let e = EngineError::invalid("bank id must be a UUID");
        assert_eq!(e.to_string(), "Invalid input: bank id must be a UUID");

        let e = EngineError::provider("anthropic", "status 529");
        assert_eq!(e.to_string(), "Provider error: anthropic: status 529");
    }

    #[test]
    fn test_non_database_errors_are_not_unique_violations() {
        assert!(!EngineError::Conflict("x".into()).is_unique_violation());
        assert!(!EngineError::invalid("y").is_unique_violation());
    }
}
