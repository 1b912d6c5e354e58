//! `runner_heartbeats`: one row per logical runner.

use async_trait::async_trait;
use tracing::instrument;

use fieldops_outbox::{HeartbeatStore, HeartbeatUpdate, OutboxError, RunnerHeartbeat};

use super::rows::{HeartbeatRow, decode};
use super::{PostgresOutboxStore, map_sqlx_error, to_db_count};

const HEARTBEAT_COLUMNS: &str = "runner_name, last_heartbeat_at, last_success_at, last_error, \
     last_error_at, consecutive_failures, runner_instance_id";

#[async_trait]
impl HeartbeatStore for PostgresOutboxStore {
    /// First beat inserts; later beats read-modify-write under a row lock so
    /// instances sharing a runner name never lose a failure count.
    #[instrument(skip(self, update), fields(runner = %update.runner_name), err)]
    async fn record_cycle(&self, update: &HeartbeatUpdate) -> Result<RunnerHeartbeat, OutboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // A concurrent first insert blocks here until it commits, then conflicts.
        let first = RunnerHeartbeat::apply(None, update);
        let inserted = sqlx::query(
            r#"
            INSERT INTO runner_heartbeats (
                runner_name, last_heartbeat_at, last_success_at, last_error,
                last_error_at, consecutive_failures, runner_instance_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (runner_name) DO NOTHING
            "#,
        )
        .bind(&first.runner_name)
        .bind(first.last_heartbeat_at)
        .bind(first.last_success_at)
        .bind(first.last_error.as_deref())
        .bind(first.last_error_at)
        .bind(to_db_count(first.consecutive_failures))
        .bind(&first.runner_instance_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_heartbeat", e))?
        .rows_affected();

        if inserted == 1 {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(first);
        }

        let select = format!(
            "SELECT {HEARTBEAT_COLUMNS} FROM runner_heartbeats WHERE runner_name = $1 FOR UPDATE"
        );
        let previous = sqlx::query(&select)
            .bind(&update.runner_name)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_heartbeat", e))
            .and_then(|row| decode::<HeartbeatRow>("load_heartbeat", &row))
            .map(RunnerHeartbeat::from)?;

        let beat = RunnerHeartbeat::apply(Some(previous), update);

        sqlx::query(
            r#"
            UPDATE runner_heartbeats SET
                last_heartbeat_at = $2,
                last_success_at = $3,
                last_error = $4,
                last_error_at = $5,
                consecutive_failures = $6,
                runner_instance_id = $7
            WHERE runner_name = $1
            "#,
        )
        .bind(&beat.runner_name)
        .bind(beat.last_heartbeat_at)
        .bind(beat.last_success_at)
        .bind(beat.last_error.as_deref())
        .bind(beat.last_error_at)
        .bind(to_db_count(beat.consecutive_failures))
        .bind(&beat.runner_instance_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_heartbeat", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(beat)
    }

    async fn get_heartbeat(
        &self,
        runner_name: &str,
    ) -> Result<Option<RunnerHeartbeat>, OutboxError> {
        let sql =
            format!("SELECT {HEARTBEAT_COLUMNS} FROM runner_heartbeats WHERE runner_name = $1");
        let row = sqlx::query(&sql)
            .bind(runner_name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_heartbeat", e))?;

        row.map(|row| decode::<HeartbeatRow>("get_heartbeat", &row).map(RunnerHeartbeat::from))
            .transpose()
    }
}
