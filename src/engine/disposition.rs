// ── Membank Engine: Disposition ────────────────────────────────────────────
// Loads the bank's (skepticism, literalism, empathy) triple and projects it
// into stance sentences for the Reflect system prompt. The mapping below is
// the reference mapping; the tests pin it so prompts stay reproducible.
//
// Axes are 1..=5. A neutral 3 contributes no sentence; >= 4 takes the high
// stance, <= 2 the low stance.

use log::warn;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::atoms::error::EngineResult;
use crate::atoms::types::Disposition;

const DEFAULT_AXIS: i32 = 3;

/// Load the disposition from `banks`, defaulting every missing or malformed
/// axis to neutral.
pub async fn load_disposition(pool: &PgPool, bank_id: Uuid) -> EngineResult<Disposition> {
    let row = sqlx::query("SELECT disposition FROM banks WHERE id = $1")
        .bind(bank_id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(Disposition::default());
    };
    Ok(parse_disposition(&row.get::<Value, _>("disposition")))
}

fn parse_disposition(value: &Value) -> Disposition {
    Disposition {
        skepticism: clamp_axis(&value["skepticism"]),
        literalism: clamp_axis(&value["literalism"]),
        empathy: clamp_axis(&value["empathy"]),
    }
}

fn clamp_axis(value: &Value) -> i32 {
    match value.as_i64() {
        Some(v) => (v as i32).clamp(1, 5),
        None => {
            if !value.is_null() {
                warn!("[disposition] Non-numeric axis value {value}, defaulting to neutral");
            }
            DEFAULT_AXIS
        }
    }
}

/// Build the reasoning-guidance block. Empty string when every axis is
/// neutral.
pub fn build_disposition_prompt(disposition: &Disposition) -> String {
    let mut guidelines: Vec<&str> = Vec::new();

    if disposition.skepticism >= 4 {
        guidelines.push(
            "Treat claims with skepticism. Prefer hedged language, actively look for \
             contradicting evidence, and require at least two independent sources before \
             asserting anything strongly.",
        );
    } else if disposition.skepticism <= 2 {
        guidelines.push(
            "Take retrieved information at face value. Do not demand extra corroboration \
             unless something is clearly inconsistent.",
        );
    }

    if disposition.literalism >= 4 {
        guidelines.push(
            "Interpret questions literally. Focus on exact wording, explicit commitments, \
             and concrete numbers.",
        );
    } else if disposition.literalism <= 2 {
        guidelines.push(
            "Read between the lines. Weigh implied intent, context, and nuance, not just \
             the literal wording.",
        );
    }

    if disposition.empathy >= 4 {
        guidelines.push(
            "Consider the emotional state and circumstances of the people involved, and \
             answer with an empathetic framing.",
        );
    } else if disposition.empathy <= 2 {
        guidelines.push(
            "Focus on facts and outcomes. Prioritize objective data and logical analysis \
             over emotional framing.",
        );
    }

    if guidelines.is_empty() {
        return String::new();
    }

    let mut lines = vec!["## Reasoning guidance".to_string(), String::new()];
    lines.extend(guidelines.iter().map(|g| format!("- {g}")));
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_neutral_disposition_is_silent() {
        assert_eq!(build_disposition_prompt(&Disposition::default()), "");
    }

    #[test]
    fn test_high_skepticism_reference_sentence() {
        let prompt = build_disposition_prompt(&Disposition {
            skepticism: 5,
            literalism: 3,
            empathy: 3,
        });
        assert!(prompt.contains("at least two independent sources"));
        assert!(!prompt.contains("between the lines"));
        assert!(!prompt.contains("empathetic"));
    }

    #[test]
    fn test_low_axes() {
        let prompt = build_disposition_prompt(&Disposition {
            skepticism: 1,
            literalism: 2,
            empathy: 2,
        });
        assert!(prompt.contains("face value"));
        assert!(prompt.contains("between the lines"));
        assert!(prompt.contains("objective data"));
    }

    #[test]
    fn test_one_sentence_per_non_neutral_axis() {
        let prompt = build_disposition_prompt(&Disposition {
            skepticism: 4,
            literalism: 3,
            empathy: 5,
        });
        let bullets = prompt.lines().filter(|l| l.starts_with("- ")).count();
        assert_eq!(bullets, 2);
    }

    #[test]
    fn test_parse_clamps_and_defaults() {
        let parsed = parse_disposition(&json!({
            "skepticism": 99,
            "literalism": -4,
            "empathy": "warm",
        }));
        assert_eq!(parsed.skepticism, 5);
        assert_eq!(parsed.literalism, 1);
        assert_eq!(parsed.empathy, 3);

        let empty = parse_disposition(&json!({}));
        assert_eq!(empty, Disposition::default());
    }
}
