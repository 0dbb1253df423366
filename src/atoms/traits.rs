// ── Membank Atoms: Provider Traits ─────────────────────────────────────────
// The golden trait every AI provider implements. Two call shapes cover the
// whole engine:
//
//   • `complete`  — deterministic (temperature 0.0) text completion used by
//     extraction, consolidation and mental-model generation. Callers parse
//     the returned text themselves (tolerant JSON-array extraction).
//   • `converse`  — one tool-use turn. The provider returns either tool
//     requests or a final message; the caller echoes every tool result back
//     into the next turn's message list.
//
// Model identifiers are passed per call so configuration stays lazy.

use async_trait::async_trait;
use serde_json::Value;

use crate::atoms::error::EngineResult;

// ── Conversation wire types ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverseRole {
    User,
    Assistant,
}

/// One content block inside a conversation message.
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    /// A tool request emitted by the model.
    ToolUse { id: String, name: String, input: Value },
    /// A tool result echoed back by the caller.
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone)]
pub struct ConverseMessage {
    pub role: ConverseRole,
    pub content: Vec<ContentPart>,
}

impl ConverseMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        ConverseMessage { role: ConverseRole::User, content: vec![ContentPart::Text(text.into())] }
    }

    /// Concatenated text blocks of this message.
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        for block in &self.content {
            if let ContentPart::Text(t) = block {
                parts.push(t.as_str());
            }
        }
        parts.join("\n")
    }

    /// Tool requests contained in this message, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentPart::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Tool exposed to a converse call. `input_schema` is a JSON Schema object.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Result of one converse turn.
#[derive(Debug, Clone)]
pub struct ConverseTurn {
    pub stop_reason: StopReason,
    pub message: ConverseMessage,
}

/// Deterministic completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub user: &'a str,
    pub max_tokens: u32,
}

/// Tool-use conversation request.
#[derive(Debug, Clone)]
pub struct ConverseRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub messages: &'a [ConverseMessage],
    pub tools: &'a [ToolSpec],
    pub max_tokens: u32,
}

// ── The trait ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Deterministic small-model completion. Returns the raw assistant text.
    async fn complete(&self, req: CompletionRequest<'_>) -> EngineResult<String>;

    /// One tool-use conversation turn.
    async fn converse(&self, req: ConverseRequest<'_>) -> EngineResult<ConverseTurn>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_text_joins_blocks() {
        let msg = ConverseMessage {
            role: ConverseRole::Assistant,
            content: vec![
                ContentPart::Text("first".into()),
                ContentPart::ToolUse { id: "t1".into(), name: "recall".into(), input: json!({}) },
                ContentPart::Text("second".into()),
            ],
        };
        assert_eq!(msg.text(), "first\nsecond");
        assert_eq!(msg.tool_uses().len(), 1);
        assert_eq!(msg.tool_uses()[0].1, "recall");
    }
}
