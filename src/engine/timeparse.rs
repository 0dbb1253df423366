// ── Membank Engine: Relative Time Parsing ──────────────────────────────────
// Extracts a UTC time window from relative expressions in a recall query
// ("yesterday", "last week", "3 days ago", "2024-06"). No match means no
// temporal filter; the caller's explicit range always wins over this.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use regex::Regex;

/// Cap for "N days/weeks/months ago" style expressions (10 years).
const MAX_RELATIVE_DAYS: i64 = 3650;

type Range = (DateTime<Utc>, DateTime<Utc>);

struct Pattern {
    regex: Regex,
    handler: fn(&regex::Captures, DateTime<Utc>) -> Option<Range>,
}

fn midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn patterns() -> &'static Vec<Pattern> {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // More specific patterns first.
        vec![
            Pattern {
                regex: Regex::new(r"(?i)\b(\d+)\s*days?\s+ago\b").unwrap(),
                handler: |m, now| {
                    let n = m[1].parse::<i64>().ok()?.min(MAX_RELATIVE_DAYS);
                    let today = midnight(now);
                    Some((today - Duration::days(n), today))
                },
            },
            Pattern {
                regex: Regex::new(r"(?i)\b(\d+)\s*weeks?\s+ago\b").unwrap(),
                handler: |m, now| {
                    let n = m[1].parse::<i64>().ok()?.min(MAX_RELATIVE_DAYS / 7);
                    let today = midnight(now);
                    Some((today - Duration::weeks(n), today))
                },
            },
            Pattern {
                regex: Regex::new(r"(?i)\b(\d+)\s*months?\s+ago\b").unwrap(),
                handler: |m, now| {
                    let n = m[1].parse::<i64>().ok()?.min(MAX_RELATIVE_DAYS / 30);
                    let today = midnight(now);
                    Some((today - Duration::days(30 * n), today))
                },
            },
            Pattern {
                // "2024-06" or "June 2024"-free numeric form only.
                regex: Regex::new(r"\b(\d{4})-(\d{1,2})\b").unwrap(),
                handler: |m, _now| {
                    let year = m[1].parse::<i32>().ok()?;
                    let month = m[2].parse::<u32>().ok()?;
                    if !(1..=12).contains(&month) {
                        return None;
                    }
                    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                    let end = if month == 12 {
                        Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()?
                    } else {
                        Utc.with_ymd_and_hms(year, month + 1, 1, 0, 0, 0).single()?
                    };
                    Some((start, end))
                },
            },
            Pattern {
                regex: Regex::new(r"(?i)\bday\s+before\s+yesterday\b").unwrap(),
                handler: |_m, now| {
                    let today = midnight(now);
                    Some((today - Duration::days(2), today - Duration::days(1)))
                },
            },
            Pattern {
                regex: Regex::new(r"(?i)\byesterday\b").unwrap(),
                handler: |_m, now| {
                    let today = midnight(now);
                    Some((today - Duration::days(1), today))
                },
            },
            Pattern {
                regex: Regex::new(r"(?i)\btoday\b").unwrap(),
                handler: |_m, now| {
                    let today = midnight(now);
                    Some((today, today + Duration::days(1)))
                },
            },
            Pattern {
                regex: Regex::new(r"(?i)\blast\s+week\b").unwrap(),
                handler: |_m, now| {
                    let today = midnight(now);
                    Some((today - Duration::days(7), today))
                },
            },
            Pattern {
                regex: Regex::new(r"(?i)\blast\s+month\b").unwrap(),
                handler: |_m, now| {
                    let today = midnight(now);
                    Some((today - Duration::days(30), today))
                },
            },
            Pattern {
                regex: Regex::new(r"(?i)\blast\s+year\b").unwrap(),
                handler: |_m, now| {
                    let today = midnight(now);
                    Some((today - Duration::days(365), today))
                },
            },
        ]
    })
}

/// Extract the first matching time range from a query. Returns `None` when
/// nothing matches (temporal filtering is skipped).
pub fn extract_time_range(query: &str) -> Option<Range> {
    extract_time_range_at(query, Utc::now())
}

/// Testable variant with an injected clock.
pub fn extract_time_range_at(query: &str, now: DateTime<Utc>) -> Option<Range> {
    for pattern in patterns() {
        if let Some(captures) = pattern.regex.captures(query) {
            if let Some(range) = (pattern.handler)(&captures, now) {
                return Some(range);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 13, 45, 0).unwrap()
    }

    #[test]
    fn test_yesterday() {
        let (start, end) = extract_time_range_at("what happened yesterday?", fixed_now()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 14, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_n_days_ago_capped() {
        let (start, end) =
            extract_time_range_at("meetings 3 days ago", fixed_now()).unwrap();
        assert_eq!(end - start, Duration::days(3));

        let (start, end) =
            extract_time_range_at("99999 days ago", fixed_now()).unwrap();
        assert_eq!(end - start, Duration::days(MAX_RELATIVE_DAYS));
    }

    #[test]
    fn test_year_month() {
        let (start, end) = extract_time_range_at("trips in 2024-06", fixed_now()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_december_rolls_year() {
        let (start, end) = extract_time_range_at("2024-12 recap", fixed_now()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_day_before_yesterday_beats_yesterday() {
        let (start, end) =
            extract_time_range_at("the day before yesterday", fixed_now()).unwrap();
        assert_eq!(end - start, Duration::days(1));
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 6, 14, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_month_ignored() {
        assert!(extract_time_range_at("in 2024-13", fixed_now()).is_none());
    }

    #[test]
    fn test_no_match() {
        assert!(extract_time_range_at("where does Alice work?", fixed_now()).is_none());
    }
}
