// ── Membank Engine: Database Pool ──────────────────────────────────────────
// PgPool lifecycle. The pool is created from DATABASE_URL, migrations run at
// initialization, and `close_pool` drains connections on shutdown. pgvector
// types bind through the `pgvector` crate's sqlx integration, so no per-
// connection type registration is needed.

use std::time::Duration;

use log::info;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config;

const POOL_MIN_CONNECTIONS: u32 = 2;
const POOL_MAX_CONNECTIONS: u32 = 10;
const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Create the process-wide connection pool and bring the schema up to date.
pub async fn create_pool() -> EngineResult<PgPool> {
    let url = config::database_url()?;

    let pool = PgPoolOptions::new()
        .min_connections(POOL_MIN_CONNECTIONS)
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(POOL_ACQUIRE_TIMEOUT_SECS))
        .connect(&url)
        .await
        .map_err(|e| {
            EngineError::Config(format!(
                "Cannot connect to database. Ensure PostgreSQL is running: {e}"
            ))
        })?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| EngineError::Config(format!("Migration failed: {e}")))?;

    info!(
        "[db] Connection pool created (min={}, max={})",
        POOL_MIN_CONNECTIONS, POOL_MAX_CONNECTIONS
    );
    Ok(pool)
}

/// Close the pool, waiting for in-flight connections to drain.
pub async fn close_pool(pool: &PgPool) {
    pool.close().await;
    info!("[db] Connection pool closed");
}
