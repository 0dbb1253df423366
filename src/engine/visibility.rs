// ── Membank Engine: Tag Visibility ─────────────────────────────────────────
// Tag filtering for observation / mental-model search, in four match modes:
//
//   any        — OR match, untagged rows included (default)
//   all        — AND match, untagged rows included
//   any_strict — OR match, untagged rows excluded
//   all_strict — AND match, untagged rows excluded
//
// `all_strict` is the security mode: a tagged mental model refresh must see
// only rows carrying every one of its tags, never unscoped data.

use sqlx::{Postgres, QueryBuilder};

use crate::atoms::types::TagsMatch;

/// Append `AND <tags predicate>` to a query under construction. The column
/// name is fixed to `tags`; the tag list is bound, never interpolated.
pub fn push_tags_predicate(
    qb: &mut QueryBuilder<'_, Postgres>,
    tags: &[String],
    mode: TagsMatch,
) {
    if tags.is_empty() {
        return;
    }

    // && = overlap (any), @> = contains (all).
    let operator = if mode.requires_all() { "@>" } else { "&&" };

    if mode.is_strict() {
        qb.push(" AND cardinality(tags) > 0 AND tags ");
        qb.push(operator);
        qb.push(" ");
        qb.push_bind(tags.to_vec());
        qb.push("::text[]");
    } else {
        qb.push(" AND (cardinality(tags) = 0 OR tags ");
        qb.push(operator);
        qb.push(" ");
        qb.push_bind(tags.to_vec());
        qb.push("::text[])");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(tags: &[&str], mode: TagsMatch) -> String {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT id FROM memory_units WHERE bank_id = $1");
        let tags: Vec<String> = tags.iter().map(|s| s.to_string()).collect();
        push_tags_predicate(&mut qb, &tags, mode);
        qb.sql().to_string()
    }

    #[test]
    fn test_empty_tags_add_nothing() {
        let sql = build(&[], TagsMatch::AllStrict);
        assert_eq!(sql, "SELECT id FROM memory_units WHERE bank_id = $1");
    }

    #[test]
    fn test_any_includes_untagged() {
        let sql = build(&["work"], TagsMatch::Any);
        assert!(sql.contains("cardinality(tags) = 0 OR tags &&"));
    }

    #[test]
    fn test_all_uses_contains_operator() {
        let sql = build(&["work", "hr"], TagsMatch::All);
        assert!(sql.contains("tags @>"));
        assert!(sql.contains("cardinality(tags) = 0 OR"));
    }

    #[test]
    fn test_strict_excludes_untagged() {
        let sql = build(&["work"], TagsMatch::AllStrict);
        assert!(sql.contains("cardinality(tags) > 0 AND tags @>"));
        assert!(!sql.contains("cardinality(tags) = 0"));
    }

    #[test]
    fn test_any_strict() {
        let sql = build(&["work"], TagsMatch::AnyStrict);
        assert!(sql.contains("cardinality(tags) > 0 AND tags &&"));
    }
}
