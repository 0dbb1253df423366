//! Membank — a three-tier memory engine for AI agents.
//!
//! The engine persists structured 5W1H facts extracted from conversations
//! (Retain), retrieves them with hybrid semantic + lexical search (Recall),
//! consolidates them into durable observations in the background, curates
//! per-entity mental models, and answers questions through a bounded
//! tool-use loop with citation validation (Reflect).
//!
//! All data is partitioned by bank: a tenant-level scope carrying a persona
//! (mission, background, disposition, directives) and owning every memory
//! unit, entity, link, and mental model beneath it.
//!
//! ```no_run
//! use membank::{MemoryEngine, RecallOptions};
//!
//! # async fn demo() -> membank::EngineResult<()> {
//! let mut engine = MemoryEngine::new();
//! engine.initialize().await?;
//!
//! let bank = "8b7e9a52-5c9e-4a0f-9e1a-0c1d2e3f4a5b";
//! engine.retain(bank, "Alice joined Acme on 2024-06-01 as an engineer.", "").await?;
//! let hits = engine.recall(bank, "Where does Alice work?", RecallOptions::default()).await?;
//! println!("{} results", hits.results.len());
//!
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{
    Disposition, EntityType, FactKind, FactType, FreshnessStatus, MentalModel, RecallHit,
    RecallOptions, RecallResponse, ReflectOptions, ReflectOutcome, RetainOutcome, TagsMatch,
};
pub use engine::MemoryEngine;
