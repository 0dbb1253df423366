// ── Membank Engine ─────────────────────────────────────────────────────────
// The pipelines and their shared infrastructure. `MemoryEngine` at the
// bottom of this file is the caller-facing facade: lifecycle, semaphores,
// and the retain / recall / reflect contract.

pub mod chunking;
pub mod config;
pub mod consolidation;
pub mod db;
pub mod directive;
pub mod disposition;
pub mod embedding;
pub mod entity;
pub mod extraction;
pub mod freshness;
pub mod graph;
pub mod http;
pub mod mental_model;
pub mod mental_model_trigger;
pub mod ops;
pub mod providers;
pub mod recall;
pub mod reflect;
pub mod reranker;
pub mod retain;
pub mod scheduler;
pub mod timeparse;
pub mod tokenizer;
pub mod visibility;

use log::info;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{RecallOptions, RecallResponse, ReflectOptions, ReflectOutcome, RetainOutcome};

use self::consolidation::ConsolidationStats;
use self::scheduler::ConsolidationScheduler;

/// Concurrent write-path operations per process.
const PUT_CONCURRENCY: usize = 5;

/// Concurrent search-side operations per process.
const SEARCH_CONCURRENCY: usize = 32;

/// The memory engine: pool lifecycle, the consolidation scheduler, and the
/// three caller-facing operations. Every operation takes a bank id validated
/// as UUID-shaped at this boundary and never mutates state outside that
/// bank.
pub struct MemoryEngine {
    pool: Option<PgPool>,
    scheduler: Option<ConsolidationScheduler>,
    put_semaphore: Semaphore,
    search_semaphore: Semaphore,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine {
            pool: None,
            scheduler: None,
            put_semaphore: Semaphore::new(PUT_CONCURRENCY),
            search_semaphore: Semaphore::new(SEARCH_CONCURRENCY),
        }
    }

    /// Open the pool, run migrations, and start exactly one consolidation
    /// task. Initializing twice is a no-op.
    pub async fn initialize(&mut self) -> EngineResult<()> {
        if self.pool.is_some() {
            return Ok(());
        }

        let pool = db::create_pool().await?;
        let mut scheduler =
            ConsolidationScheduler::new(pool.clone(), config::consolidation_interval_secs());
        scheduler.start();

        self.pool = Some(pool);
        self.scheduler = Some(scheduler);
        info!("[engine] MemoryEngine initialized");
        Ok(())
    }

    /// Stop the scheduler first, then close the pool.
    pub async fn close(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }
        if let Some(pool) = self.pool.take() {
            db::close_pool(&pool).await;
        }
        info!("[engine] MemoryEngine closed");
    }

    fn pool(&self) -> EngineResult<&PgPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| EngineError::Config("MemoryEngine is not initialized".into()))
    }

    /// Extract facts from a conversation turn and persist them.
    pub async fn retain(
        &self,
        bank_id: &str,
        content: &str,
        context: &str,
    ) -> EngineResult<RetainOutcome> {
        let bank_id = validate_bank_id(bank_id)?;
        let pool = self.pool()?;
        let _permit = self
            .put_semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::Fatal("write semaphore closed".into()))?;
        retain::retain(pool, bank_id, content, context).await
    }

    /// Hybrid search over the bank's memories.
    pub async fn recall(
        &self,
        bank_id: &str,
        query: &str,
        options: RecallOptions,
    ) -> EngineResult<RecallResponse> {
        let bank_id = validate_bank_id(bank_id)?;
        let pool = self.pool()?;
        let _permit = self
            .search_semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::Fatal("search semaphore closed".into()))?;
        recall::recall(pool, bank_id, query, &options).await
    }

    /// Evidence-grounded reasoning over the three memory tiers.
    pub async fn reflect(
        &self,
        bank_id: &str,
        query: &str,
        options: ReflectOptions,
    ) -> EngineResult<ReflectOutcome> {
        let bank_id = validate_bank_id(bank_id)?;
        let pool = self.pool()?;
        let _permit = self
            .search_semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::Fatal("search semaphore closed".into()))?;
        reflect::reflect(pool, bank_id, query, &options).await
    }

    /// Manually run one consolidation pass over every pending bank.
    pub async fn trigger_consolidation(&self) -> EngineResult<Vec<(Uuid, ConsolidationStats)>> {
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or_else(|| EngineError::Config("MemoryEngine is not initialized".into()))?;
        scheduler.trigger().await
    }
}

/// Bank ids must be UUID-shaped; anything else is rejected before touching
/// the database.
pub fn validate_bank_id(bank_id: &str) -> EngineResult<Uuid> {
    Uuid::parse_str(bank_id.trim())
        .map_err(|_| EngineError::invalid("Invalid bank_id format. Expected UUID."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bank_id() {
        assert!(validate_bank_id("8b7e9a52-5c9e-4a0f-9e1a-0c1d2e3f4a5b").is_ok());
        assert!(validate_bank_id(" 8b7e9a52-5c9e-4a0f-9e1a-0c1d2e3f4a5b ").is_ok());
        assert!(matches!(
            validate_bank_id("not-a-uuid"),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(validate_bank_id("").is_err());
    }

    #[tokio::test]
    async fn test_uninitialized_engine_rejects_operations() {
        let engine = MemoryEngine::new();
        let err = engine
            .retain("8b7e9a52-5c9e-4a0f-9e1a-0c1d2e3f4a5b", "text", "")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
