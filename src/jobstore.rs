/// Shared SQL building blocks for the per-kind queue repositories.
///
/// Each queue kind writes out its own full SQL (matching how the ambient
/// stack's Postgres store never hides a query behind a generic ORM layer),
/// but the *shape* of the claim-and-mark transaction and the stale-recovery
/// sweep is identical across kinds, so it lives here once.
///
/// Grounded in the claim-via-CTE-plus-SKIP-LOCKED pattern: select ready rows
/// under `FOR UPDATE SKIP LOCKED`, then update just the claimed set in the
/// same statement via a `RETURNING` clause, so no separate round-trip can
/// race another claimant.

use sqlx::postgres::PgRow;
use sqlx::PgPool;

use crate::errors::CoreError;

/// Describes one kind's claim query. `table` and the SQL fragments are
/// trusted static strings supplied by the calling module, never user input.
pub struct ClaimQuery {
    pub table: &'static str,
    /// WHERE predicate selecting claimable rows, e.g.
    /// `"status = 'pending' AND scheduled_at <= now()"`.
    pub ready_predicate: &'static str,
    /// SET clause applied to the claimed rows, e.g.
    /// `"status = 'processing', started_at = now(), attempt_count = attempt_count + 1"`.
    pub set_clause: &'static str,
}

/// Standard claim ordering: higher priority first, then earliest-scheduled,
/// then earliest-created. The id is deliberately excluded from the order key.
pub const CLAIM_ORDER_BY: &str = "priority DESC, scheduled_at ASC, created_at ASC";

/// Claim up to `batch_size` ready rows from `query.table`, marking them
/// processing in the same statement, and return the claimed rows.
///
/// `batch_size <= 0` falls back to `fallback_batch_size` per the "dequeue(0)
/// uses the configured batch size" boundary behavior.
pub async fn claim_batch(
    pool: &PgPool,
    query: &ClaimQuery,
    batch_size: i64,
    fallback_batch_size: i64,
) -> Result<Vec<PgRow>, CoreError> {
    let batch_size = if batch_size <= 0 { fallback_batch_size } else { batch_size };

    let sql = format!(
        "WITH claimed AS (
            SELECT id FROM {table}
            WHERE {ready}
            ORDER BY {order}
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE {table}
        SET {set_clause}
        FROM claimed
        WHERE {table}.id = claimed.id
        RETURNING {table}.*",
        table = query.table,
        ready = query.ready_predicate,
        order = CLAIM_ORDER_BY,
        set_clause = query.set_clause,
    );

    sqlx::query(&sql)
        .bind(batch_size)
        .fetch_all(pool)
        .await
        .map_err(CoreError::from)
}

/// Reset rows stuck in `processing` longer than `threshold_minutes` back to
/// `pending`, clearing `started_at` and resetting `scheduled_at` to now.
/// Returns the number of rows recovered.
pub async fn recover_stale(
    pool: &PgPool,
    table: &'static str,
    threshold_minutes: i64,
) -> Result<u64, CoreError> {
    let sql = format!(
        "UPDATE {table}
         SET status = 'pending', started_at = NULL, scheduled_at = now()
         WHERE status = 'processing'
           AND started_at < now() - ($1 || ' minutes')::interval",
        table = table,
    );

    let result = sqlx::query(&sql)
        .bind(threshold_minutes.to_string())
        .execute(pool)
        .await
        .map_err(CoreError::from)?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_sql_embeds_skip_locked_and_returning() {
        let query = ClaimQuery {
            table: "chunk_embedding_jobs",
            ready_predicate: "status = 'pending' AND scheduled_at <= now()",
            set_clause: "status = 'processing', started_at = now(), attempt_count = attempt_count + 1",
        };
        let sql = format!(
            "WITH claimed AS (
                SELECT id FROM {table}
                WHERE {ready}
                ORDER BY {order}
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table}
            SET {set_clause}
            FROM claimed
            WHERE {table}.id = claimed.id
            RETURNING {table}.*",
            table = query.table,
            ready = query.ready_predicate,
            order = CLAIM_ORDER_BY,
            set_clause = query.set_clause,
        );
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("RETURNING chunk_embedding_jobs.*"));
        assert!(sql.contains("priority DESC, scheduled_at ASC, created_at ASC"));
    }
}
