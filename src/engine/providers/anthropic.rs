// ── Membank Engine: Anthropic Provider ─────────────────────────────────────
// Implements the AiProvider golden trait against the Anthropic Messages API.
// All Claude-specific request shaping and content-block parsing lives here.
//
// Two call shapes:
//   • complete  — temperature 0.0, no tools; extraction / consolidation /
//     generation prompts.
//   • converse  — tool catalog attached; returns tool requests or the final
//     assistant message. Tool results arrive back as `tool_result` blocks in
//     the caller-built message list.

use async_trait::async_trait;
use log::{error, warn};
use reqwest::Client;
use serde_json::{json, Value};

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{
    AiProvider, CompletionRequest, ContentPart, ConverseMessage, ConverseRequest, ConverseRole,
    ConverseTurn, StopReason,
};
use crate::engine::config;
use crate::engine::http::{is_retryable_status, parse_retry_after, retry_delay, truncate_utf8, MAX_RETRIES};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 120;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn from_env() -> Self {
        AnthropicProvider {
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            base_url: config::anthropic_base_url(),
        }
    }

    /// POST /v1/messages with retry on transient failures.
    async fn post_messages(&self, body: Value) -> EngineResult<Value> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let api_key = config::anthropic_api_key()?;

        let mut last_error = String::new();
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!(
                    "[provider] Anthropic retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let response = match self
                .client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("transport: {e}");
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(EngineError::provider("anthropic", last_error));
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("API error {}: {}", status, truncate_utf8(&body_text, 200));
                error!("[provider] Anthropic error {}: {}", status, truncate_utf8(&body_text, 500));

                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(EngineError::provider("anthropic", last_error));
            }

            return Ok(response.json::<Value>().await?);
        }

        Err(EngineError::provider("anthropic", last_error))
    }

    /// Convert engine messages into the Anthropic wire format. Tool results
    /// always ride in a user-role message.
    fn format_messages(messages: &[ConverseMessage]) -> Vec<Value> {
        let mut formatted = Vec::with_capacity(messages.len());
        for msg in messages {
            let role = match msg.role {
                ConverseRole::User => "user",
                ConverseRole::Assistant => "assistant",
            };
            let blocks: Vec<Value> = msg
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text(text) => json!({"type": "text", "text": text}),
                    ContentPart::ToolUse { id, name, input } => json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    }),
                    ContentPart::ToolResult { tool_use_id, content } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                    }),
                })
                .collect();
            formatted.push(json!({"role": role, "content": blocks}));
        }
        formatted
    }

    /// Parse the response message into engine content parts.
    fn parse_message(value: &Value) -> ConverseMessage {
        let mut content = Vec::new();
        if let Some(blocks) = value["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(t) = block["text"].as_str() {
                            content.push(ContentPart::Text(t.to_string()));
                        }
                    }
                    Some("tool_use") => {
                        content.push(ContentPart::ToolUse {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            input: block["input"].clone(),
                        });
                    }
                    _ => {}
                }
            }
        }
        ConverseMessage { role: ConverseRole::Assistant, content }
    }

    fn parse_stop_reason(value: &Value) -> StopReason {
        match value["stop_reason"].as_str() {
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        }
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    async fn complete(&self, req: CompletionRequest<'_>) -> EngineResult<String> {
        let body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": 0.0,
            "system": req.system,
            "messages": [{"role": "user", "content": req.user}],
        });

        let response = self.post_messages(body).await?;
        let message = Self::parse_message(&response);
        Ok(message.text())
    }

    async fn converse(&self, req: ConverseRequest<'_>) -> EngineResult<ConverseTurn> {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        let body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": 0.0,
            "system": req.system,
            "messages": Self::format_messages(req.messages),
            "tools": tools,
        });

        let response = self.post_messages(body).await?;
        Ok(ConverseTurn {
            stop_reason: Self::parse_stop_reason(&response),
            message: Self::parse_message(&response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_messages_tool_result_rides_user_role() {
        let messages = vec![
            ConverseMessage::user_text("question"),
            ConverseMessage {
                role: ConverseRole::Assistant,
                content: vec![ContentPart::ToolUse {
                    id: "tu_1".into(),
                    name: "recall".into(),
                    input: json!({"query": "x"}),
                }],
            },
            ConverseMessage {
                role: ConverseRole::User,
                content: vec![ContentPart::ToolResult {
                    tool_use_id: "tu_1".into(),
                    content: "{\"results\": []}".into(),
                }],
            },
        ];
        let wire = AnthropicProvider::format_messages(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn test_parse_message_and_stop_reason() {
        let response = json!({
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "thinking"},
                {"type": "tool_use", "id": "tu_9", "name": "done", "input": {"answer": "a"}},
            ],
        });
        assert_eq!(AnthropicProvider::parse_stop_reason(&response), StopReason::ToolUse);
        let msg = AnthropicProvider::parse_message(&response);
        assert_eq!(msg.text(), "thinking");
        let uses = msg.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "tu_9");
        assert_eq!(uses[0].1, "done");
    }

    #[test]
    fn test_parse_stop_reason_defaults_to_end_turn() {
        assert_eq!(
            AnthropicProvider::parse_stop_reason(&json!({"stop_reason": "end_turn"})),
            StopReason::EndTurn
        );
        assert_eq!(AnthropicProvider::parse_stop_reason(&json!({})), StopReason::EndTurn);
    }
}
