// ── Membank Engine: Token Estimation ───────────────────────────────────────
// Single source of truth for token estimation. The engine operates on text
// (not raw tokens), so counts are estimated from character length with a
// conservative ratio; overestimating slightly keeps budget trims safe.

/// Average characters per token. 3.5 overestimates token counts for English
/// text, which is the safe direction for a budget.
const CHARS_PER_TOKEN: f32 = 3.5;

/// Estimate the number of tokens in a string. Non-empty text always counts
/// as at least one token. Char count (not byte count) keeps CJK/emoji text
/// from being overcounted.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let char_count = text.chars().count();
    ((char_count as f32 / CHARS_PER_TOKEN).ceil() as usize).max(1)
}

/// Estimated token cost of a recall hit: text plus optional context.
pub fn unit_cost(text: &str, context: Option<&str>) -> usize {
    count_tokens(text) + context.map(count_tokens).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_counting() {
        // 13 chars at 3.5 chars/token ≈ 4 tokens.
        let count = count_tokens("Hello, world!");
        assert!((3..=5).contains(&count), "expected ~4, got {count}");
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("a"), 1);
    }

    #[test]
    fn test_long_text() {
        let text = "a".repeat(1000);
        let count = count_tokens(&text);
        assert!((280..=300).contains(&count), "expected ~286, got {count}");
    }

    #[test]
    fn test_unit_cost_includes_context() {
        let base = unit_cost("some memory text", None);
        let with_ctx = unit_cost("some memory text", Some("meeting notes"));
        assert!(with_ctx > base);
    }
}
