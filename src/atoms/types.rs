// ── Membank Atoms: Domain Types ────────────────────────────────────────────
// Core enums and record structs shared across the engine. Enums are stored
// as lowercase text in PostgreSQL; `as_str`/`parse` pairs keep the mapping
// in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════
// Classification enums
// ═══════════════════════════════════════════════════════════════════════════

/// Tier of a memory unit. `World`/`Experience` are raw facts eligible for
/// consolidation; `Observation` is consolidated knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactType {
    World,
    Experience,
    Observation,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::World => "world",
            FactType::Experience => "experience",
            FactType::Observation => "observation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "world" => Some(FactType::World),
            "experience" => Some(FactType::Experience),
            "observation" => Some(FactType::Observation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactKind {
    /// Dated occurrence; deduplicated within a 12-hour window.
    Event,
    /// Ongoing state or preference; deduplicated against recent units.
    Conversation,
}

impl FactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactKind::Event => "event",
            FactKind::Conversation => "conversation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event" => Some(FactKind::Event),
            "conversation" => Some(FactKind::Conversation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Concept,
    Event,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Location => "location",
            EntityType::Concept => "concept",
            EntityType::Event => "event",
            EntityType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(EntityType::Person),
            "organization" => Some(EntityType::Organization),
            "location" => Some(EntityType::Location),
            "concept" => Some(EntityType::Concept),
            "event" => Some(EntityType::Event),
            "other" => Some(EntityType::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Temporal,
    Semantic,
    Entity,
    Causes,
    CausedBy,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Temporal => "temporal",
            LinkType::Semantic => "semantic",
            LinkType::Entity => "entity",
            LinkType::Causes => "causes",
            LinkType::CausedBy => "caused_by",
        }
    }
}

/// Evidence-density status of an observation, recomputed after each
/// consolidation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessStatus {
    New,
    Strengthening,
    Stable,
    Weakening,
    Stale,
}

impl FreshnessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessStatus::New => "new",
            FreshnessStatus::Strengthening => "strengthening",
            FreshnessStatus::Stable => "stable",
            FreshnessStatus::Weakening => "weakening",
            FreshnessStatus::Stale => "stale",
        }
    }
}

/// Tag visibility modes. Non-strict modes include untagged rows; strict
/// modes exclude them (the refresh path for tagged mental models must use
/// `AllStrict` so tagged summaries never absorb unscoped data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagsMatch {
    #[default]
    Any,
    All,
    AnyStrict,
    AllStrict,
}

impl TagsMatch {
    pub fn is_strict(&self) -> bool {
        matches!(self, TagsMatch::AnyStrict | TagsMatch::AllStrict)
    }

    pub fn requires_all(&self) -> bool {
        matches!(self, TagsMatch::All | TagsMatch::AllStrict)
    }
}

/// Lifecycle of a durable async job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Bank persona
// ═══════════════════════════════════════════════════════════════════════════

/// Disposition triple shaping Reflect's system prompt. Each axis is clamped
/// to 1..=5; 3 is neutral and contributes no stance sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    pub skepticism: i32,
    pub literalism: i32,
    pub empathy: i32,
}

impl Default for Disposition {
    fn default() -> Self {
        Disposition { skepticism: 3, literalism: 3, empathy: 3 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Extraction output
// ═══════════════════════════════════════════════════════════════════════════

/// One 5W1H fact extracted from conversation text. Only `world`/`experience`
/// fact types are ever produced here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub text: String,
    pub what: Option<String>,
    pub who: Vec<String>,
    pub when_description: Option<String>,
    pub where_description: Option<String>,
    pub why_description: Option<String>,
    pub event_date: Option<DateTime<Utc>>,
    pub occurred_start: Option<DateTime<Utc>>,
    pub occurred_end: Option<DateTime<Utc>>,
    pub fact_kind: FactKind,
    pub fact_type: FactType,
}

// ═══════════════════════════════════════════════════════════════════════════
// Pipeline results
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of one Retain invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetainOutcome {
    pub stored: Vec<Uuid>,
    pub deduped: Vec<Uuid>,
}

/// Per-hit score components kept for debuggability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreBreakdown {
    /// 1-based rank in the semantic channel, if the hit appeared there.
    pub semantic_rank: Option<usize>,
    /// 1-based rank in the lexical channel, if the hit appeared there.
    pub lexical_rank: Option<usize>,
    /// Summed reciprocal-rank contribution.
    pub rrf: f64,
    /// Cross-encoder relevance, when the rerank stage ran.
    pub rerank: Option<f64>,
}

/// One recall result.
#[derive(Debug, Clone, Serialize)]
pub struct RecallHit {
    pub id: Uuid,
    pub text: String,
    pub context: Option<String>,
    pub fact_type: FactType,
    pub fact_kind: Option<FactKind>,
    pub event_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecallResponse {
    pub results: Vec<RecallHit>,
    /// Distinct units seen across both channels before trimming.
    pub total_found: usize,
}

/// Caller-tunable recall knobs. All optional; defaults in `engine::recall`.
#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    pub max_results: Option<usize>,
    pub max_tokens: Option<usize>,
    pub fact_types: Option<Vec<FactType>>,
    pub tags: Option<Vec<String>>,
    pub tags_match: TagsMatch,
    /// Explicit time window; when absent, a relative expression in the
    /// query ("yesterday", "last week") is parsed instead.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// One tool invocation made during a Reflect loop, kept for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectToolCall {
    pub tool: String,
    pub iteration: u32,
    pub elapsed_ms: u64,
}

/// Outcome of one Reflect invocation. `cited_ids` is the validated union of
/// every cited id; the typed subsets exist for the mental-model lifecycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReflectOutcome {
    pub answer: String,
    pub cited_ids: Vec<Uuid>,
    pub memory_ids: Vec<Uuid>,
    pub observation_ids: Vec<Uuid>,
    pub mental_model_ids: Vec<Uuid>,
    pub iterations: u32,
    pub tool_calls: Vec<ReflectToolCall>,
    pub elapsed_ms: u64,
}

/// Caller-tunable reflect knobs.
#[derive(Debug, Clone, Default)]
pub struct ReflectOptions {
    pub max_iterations: Option<u32>,
    pub tags: Option<Vec<String>>,
    pub tags_match: TagsMatch,
    /// Models excluded from search (a refreshing model must not cite itself).
    pub exclude_mental_model_ids: Vec<Uuid>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Mental models
// ═══════════════════════════════════════════════════════════════════════════

/// Curated per-entity or per-theme summary.
#[derive(Debug, Clone, Serialize)]
pub struct MentalModel {
    pub id: Uuid,
    pub bank_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub source_query: Option<String>,
    pub entity_id: Option<Uuid>,
    pub source_observation_ids: Vec<Uuid>,
    pub tags: Vec<String>,
    pub max_tokens: i32,
    pub refresh_after_consolidation: bool,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_type_round_trip() {
        for ft in [FactType::World, FactType::Experience, FactType::Observation] {
            assert_eq!(FactType::parse(ft.as_str()), Some(ft));
        }
        assert_eq!(FactType::parse("opinion"), None);
    }

    #[test]
    fn test_tags_match_classification() {
        assert!(!TagsMatch::Any.is_strict());
        assert!(TagsMatch::AllStrict.is_strict());
        assert!(TagsMatch::AllStrict.requires_all());
        assert!(!TagsMatch::AnyStrict.requires_all());
    }

    #[test]
    fn test_disposition_default_is_neutral() {
        let d = Disposition::default();
        assert_eq!((d.skepticism, d.literalism, d.empathy), (3, 3, 3));
    }
}
