//! `outbox_replay_audit`: append-only. A trigger rejects UPDATE and DELETE.

use async_trait::async_trait;
use tracing::instrument;

use fieldops_core::{DeadLetterId, TenantId};
use fieldops_outbox::{OutboxError, ReplayAuditEntry, ReplayAuditLog};

use super::rows::{AuditRow, decode};
use super::{PostgresOutboxStore, map_sqlx_error};

#[async_trait]
impl ReplayAuditLog for PostgresOutboxStore {
    #[instrument(
        skip(self, entry),
        fields(
            tenant_id = %entry.tenant_id,
            dead_letter_id = %entry.dead_letter_id,
            outcome = entry.outcome.as_str(),
        ),
        err
    )]
    async fn append(&self, entry: ReplayAuditEntry) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_replay_audit (
                id, tenant_id, dead_letter_id, event_id, operator_id, outcome, detail, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id.as_uuid())
        .bind(entry.dead_letter_id.as_uuid())
        .bind(entry.event_id.as_uuid())
        .bind(entry.operator_id.as_uuid())
        .bind(entry.outcome.as_str())
        .bind(entry.detail.as_deref())
        .bind(entry.recorded_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_replay_audit", e))?;

        Ok(())
    }

    async fn list_for_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Vec<ReplayAuditEntry>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, dead_letter_id, event_id, operator_id, outcome, detail,
                   recorded_at
            FROM outbox_replay_audit
            WHERE tenant_id = $1 AND dead_letter_id = $2
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(dead_letter_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_replay_audit", e))?;

        rows.iter()
            .map(|row| ReplayAuditEntry::try_from(decode::<AuditRow>("list_replay_audit", row)?))
            .collect()
    }
}
