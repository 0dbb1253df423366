// ── Membank Engine: HTTP Retry Helpers ─────────────────────────────────────
// Shared backoff policy for the LLM, embedding and rerank clients.

use std::time::Duration;

/// Maximum retry attempts after the initial request.
pub const MAX_RETRIES: u32 = 3;

/// Initial retry delay in milliseconds (doubles each attempt).
const INITIAL_RETRY_DELAY_MS: u64 = 1_000;

/// Maximum retry delay cap in milliseconds (30 seconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

/// Sleep with exponential backoff. Respects a Retry-After value if the
/// server sent one (capped at 60 s, floored at the computed backoff).
/// Returns the actual delay for logging. `attempt` is 0-based.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt.min(10));
    let capped_ms = base_ms.min(MAX_RETRY_DELAY_MS);
    let delay_ms = if let Some(secs) = retry_after_secs {
        (secs.min(60) * 1000).max(capped_ms)
    } else {
        capped_ms
    };
    let delay = Duration::from_millis(delay_ms);
    tokio::time::sleep(delay).await;
    delay
}

/// Parse a numeric Retry-After header value.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

/// Truncate to a UTF-8-safe prefix for log lines.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for s in [429, 500, 502, 503, 504, 529] {
            assert!(is_retryable_status(s), "{s} should be retryable");
        }
        for s in [400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(s), "{s} should not be retryable");
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("12"), Some(12));
        assert_eq!(parse_retry_after(" 5 "), Some(5));
        assert_eq!(parse_retry_after("Wed, 21 Oct"), None);
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let s = "héllo wörld";
        let t = truncate_utf8(s, 3);
        assert!(t.len() <= 3);
        assert!(s.starts_with(t));
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }
}
