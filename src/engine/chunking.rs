// ── Membank Engine: Pre-Chunking ───────────────────────────────────────────
// Long unit text is split into sentence-aligned passages at Retain time so
// Reflect's `expand` tool can hand back granular context. Short texts get no
// chunks at all; the parent row is already the right granularity.

/// Texts at or below this length are stored without chunks.
pub const CHUNK_THRESHOLD_CHARS: usize = 600;

/// Target passage size. Actual chunks run shorter when a sentence boundary
/// lands earlier, and a single oversized sentence is hard-split.
pub const CHUNK_TARGET_CHARS: usize = 400;

/// Split `text` into passages on sentence boundaries. Returns an empty list
/// when the text fits in a single unit.
pub fn split_into_chunks(text: &str) -> Vec<String> {
    if text.chars().count() <= CHUNK_THRESHOLD_CHARS {
        return Vec::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if !current.is_empty()
            && current.chars().count() + sentence.chars().count() > CHUNK_TARGET_CHARS
        {
            chunks.push(current.trim().to_string());
            current = String::new();
        }

        if sentence.chars().count() > CHUNK_TARGET_CHARS {
            // One sentence over budget: flush and hard-split it.
            if !current.is_empty() {
                chunks.push(current.trim().to_string());
                current = String::new();
            }
            chunks.extend(hard_split(&sentence, CHUNK_TARGET_CHARS));
            continue;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

/// Naive sentence splitter: break after '.', '!', '?' or a newline, keeping
/// the terminator with its sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '\n') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Fixed-size split on char boundaries for sentences with no usable breaks.
fn hard_split(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|window| window.iter().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_not_chunked() {
        assert!(split_into_chunks("Alice joined Acme.").is_empty());
        assert!(split_into_chunks(&"a".repeat(CHUNK_THRESHOLD_CHARS)).is_empty());
    }

    #[test]
    fn test_long_text_splits_on_sentences() {
        let sentence = "The quarterly review covered hiring plans and infrastructure costs. ";
        let text = sentence.repeat(20);
        let chunks = split_into_chunks(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= CHUNK_TARGET_CHARS + 1, "chunk too long: {chunk}");
            assert!(chunk.ends_with('.'), "chunk should end at a sentence: {chunk:?}");
        }
        // Nothing lost: every sentence word count survives.
        let original_words = text.split_whitespace().count();
        let chunk_words: usize = chunks.iter().map(|c| c.split_whitespace().count()).sum();
        assert_eq!(original_words, chunk_words);
    }

    #[test]
    fn test_oversized_sentence_is_hard_split() {
        let text = "x".repeat(1000);
        let chunks = split_into_chunks(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= CHUNK_TARGET_CHARS));
    }

    #[test]
    fn test_unicode_safety() {
        let text = "你好。".repeat(400);
        let chunks = split_into_chunks(&text);
        assert!(!chunks.is_empty());
        for c in &chunks {
            // Must be valid strings on char boundaries by construction.
            assert!(!c.is_empty());
        }
    }
}
