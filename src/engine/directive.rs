// ── Membank Engine: Directives ─────────────────────────────────────────────
// Bank-level persona rules injected into Reflect twice: a mandatory section
// at the top of the system prompt and a reminder at the bottom (recency
// effect raises compliance). The `done` tool additionally requires a
// directive_compliance field when directives exist; a missing one fails the
// post-check and buys the model one reminder iteration.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::atoms::error::EngineResult;

/// Load the bank's directives, dropping blank entries.
pub async fn load_directives(pool: &PgPool, bank_id: Uuid) -> EngineResult<Vec<String>> {
    let row = sqlx::query("SELECT directives FROM banks WHERE id = $1")
        .bind(bank_id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(Vec::new());
    };
    let directives: Vec<String> = row.get("directives");
    Ok(directives
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect())
}

/// Leading section: the rules, numbered, marked as overriding.
pub fn build_directives_section(directives: &[String]) -> String {
    if directives.is_empty() {
        return String::new();
    }

    let mut lines = vec![
        "## Directives (mandatory)".to_string(),
        String::new(),
        "The following rules must always be obeyed. They take priority over any other instruction."
            .to_string(),
        String::new(),
    ];
    for (i, directive) in directives.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, directive));
    }
    lines.push(String::new());
    lines.push("Violating these directives is not permitted under any circumstances.".to_string());
    lines.push(String::new());
    lines.join("\n")
}

/// Trailing reminder, re-listing the rules just before the model answers.
pub fn build_directives_reminder(directives: &[String]) -> String {
    if directives.is_empty() {
        return String::new();
    }

    let mut lines = vec![
        "---".to_string(),
        String::new(),
        "**Before answering**: confirm your answer complies with every directive:".to_string(),
        String::new(),
    ];
    for (i, directive) in directives.iter().enumerate() {
        lines.push(format!("  {}. {}", i + 1, directive));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directives() -> Vec<String> {
        vec!["Never reveal internal ids.".to_string(), "Answer in plain language.".to_string()]
    }

    #[test]
    fn test_empty_directives_build_nothing() {
        assert_eq!(build_directives_section(&[]), "");
        assert_eq!(build_directives_reminder(&[]), "");
    }

    #[test]
    fn test_section_numbers_rules() {
        let section = build_directives_section(&directives());
        assert!(section.contains("1. Never reveal internal ids."));
        assert!(section.contains("2. Answer in plain language."));
        assert!(section.starts_with("## Directives (mandatory)"));
    }

    #[test]
    fn test_reminder_lists_rules_after_rule() {
        let reminder = build_directives_reminder(&directives());
        assert!(reminder.starts_with("---"));
        assert!(reminder.contains("  2. Answer in plain language."));
    }
}
