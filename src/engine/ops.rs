// ── Membank Engine: Async Operations ───────────────────────────────────────
// Durable job rows in `async_operations`. Consolidation is best-effort from
// the caller's perspective; persistent per-fact failures surface here with
// status 'failed' instead of poisoning the batch.

use log::warn;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::atoms::error::EngineResult;
use crate::atoms::types::OperationStatus;

/// Record a new operation, already in the `processing` state.
pub async fn start_operation(
    pool: &PgPool,
    bank_id: Uuid,
    operation_type: &str,
    worker_id: &str,
    payload: Value,
) -> EngineResult<Uuid> {
    let row = sqlx::query(
        "INSERT INTO async_operations (bank_id, operation_type, status, worker_id, payload, started_at)
         VALUES ($1, $2, $3, $4, $5, NOW())
         RETURNING id",
    )
    .bind(bank_id)
    .bind(operation_type)
    .bind(OperationStatus::Processing.as_str())
    .bind(worker_id)
    .bind(payload)
    .fetch_one(pool)
    .await?;
    Ok(row.get("id"))
}

/// Mark an operation completed with its result payload.
pub async fn complete_operation(pool: &PgPool, operation_id: Uuid, result: Value) -> EngineResult<()> {
    sqlx::query(
        "UPDATE async_operations
         SET status = $1, result = $2, completed_at = NOW()
         WHERE id = $3",
    )
    .bind(OperationStatus::Completed.as_str())
    .bind(result)
    .bind(operation_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark an operation failed. Best-effort: a bookkeeping failure is logged,
/// never propagated over the original error.
pub async fn fail_operation(pool: &PgPool, operation_id: Uuid, error_message: &str) {
    let result = sqlx::query(
        "UPDATE async_operations
         SET status = $1, error_message = $2, completed_at = NOW()
         WHERE id = $3",
    )
    .bind(OperationStatus::Failed.as_str())
    .bind(error_message)
    .bind(operation_id)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!("[ops] Failed to record operation failure for {}: {}", operation_id, e);
    }
}

/// Record a single already-failed unit of work (no prior start row).
pub async fn record_failure(
    pool: &PgPool,
    bank_id: Uuid,
    operation_type: &str,
    worker_id: &str,
    payload: Value,
    error_message: &str,
) {
    let result = sqlx::query(
        "INSERT INTO async_operations
             (bank_id, operation_type, status, worker_id, payload, error_message, started_at, completed_at)
         VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())",
    )
    .bind(bank_id)
    .bind(operation_type)
    .bind(OperationStatus::Failed.as_str())
    .bind(worker_id)
    .bind(payload)
    .bind(error_message)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!("[ops] Failed to record failure row for bank {}: {}", bank_id, e);
    }
}
