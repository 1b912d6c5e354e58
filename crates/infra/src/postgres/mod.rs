//! Postgres-backed outbox stores.
//!
//! One `PostgresOutboxStore` implements every store trait of `fieldops-outbox`
//! over a shared `PgPool`. Tenant isolation is enforced by including
//! `tenant_id` in every WHERE clause (the claim scan is the only cross-tenant query).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (unique violation) | `23505` | `Storage` | Lost an insert race outside the enqueue path |
//! | Database (check violation) | `23514` | `Validation` | Value rejected by a table constraint |
//! | Database (other) | Any other | `Storage` | |
//! | PoolClosed / Io / Tls / ... | N/A | `Storage` | Connection problems |
//!
//! Duplicate enqueues never surface as errors: `ON CONFLICT DO NOTHING` turns
//! them into a lookup of the existing row.

mod dead_letters;
mod heartbeats;
mod outbox_events;
mod replay_audit;
mod rows;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use fieldops_outbox::OutboxError;

pub use outbox_events::enqueue_on;

/// DDL for every table the outbox uses.
pub const SCHEMA: &str = include_str!("schema.sql");

/// Postgres implementation of the outbox, dead-letter, heartbeat and audit stores.
///
/// `Send + Sync`; clone freely, clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a bounded pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Create the outbox tables, indexes and the audit trigger if missing.
#[instrument(skip(pool), err)]
pub async fn apply_schema(pool: &PgPool) -> Result<(), OutboxError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    info!("outbox schema applied");
    Ok(())
}

/// Map SQLx errors to `OutboxError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => OutboxError::Validation(msg),
                _ => OutboxError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxError::storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            OutboxError::storage(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            OutboxError::storage(format!("unexpected row not found in {operation}"))
        }
        other => OutboxError::storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Saturating conversion for `INTEGER` columns.
pub(crate) fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn from_db_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_every_table() {
        for table in [
            "outbox_events",
            "outbox_dead_letters",
            "runner_heartbeats",
            "outbox_replay_audit",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing {table}"
            );
        }
        assert!(SCHEMA.contains("UNIQUE (tenant_id, dedupe_key)"));
        assert!(SCHEMA.contains("UNIQUE (tenant_id, event_id)"));
        // Tenant-scoped claims filter on status and order by due time.
        assert!(SCHEMA.contains("ON outbox_events (tenant_id, status, next_attempt_at)"));
    }

    #[test]
    fn counts_saturate() {
        assert_eq!(to_db_count(u32::MAX), i32::MAX);
        assert_eq!(from_db_count(-1), 0);
        assert_eq!(from_db_count(3), 3);
    }

    #[test]
    fn non_database_errors_map_to_storage() {
        let err = map_sqlx_error("claim_batch", sqlx::Error::PoolClosed);
        assert_eq!(
            err,
            OutboxError::Storage("connection pool closed in claim_batch".into())
        );
    }
}
