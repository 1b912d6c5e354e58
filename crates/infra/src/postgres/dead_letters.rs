//! `outbox_dead_letters`: triage queries and the replay transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use fieldops_core::{DeadLetterId, EventId, OperatorId, TenantId};
use fieldops_outbox::{
    AppliedReplay, DeadLetterFilter, DeadLetterRecord, DeadLetterStore, EventRecord, EventStatus,
    OutboxError, Page, Pagination, ReplayError, ReplayTransition,
};

use super::rows::{DEAD_LETTER_COLUMNS, DeadLetterRow, EVENT_COLUMNS, EventRow, decode};
use super::{PostgresOutboxStore, is_unique_violation, map_sqlx_error};

#[async_trait]
impl DeadLetterStore for PostgresOutboxStore {
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id, total), err)]
    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterRecord>, OutboxError> {
        // Optional filters collapse to TRUE when NULL so one statement serves every combination.
        const FILTERS: &str = r#"
            tenant_id = $1
                AND ($2::timestamptz IS NULL OR created_at >= $2)
                AND ($3::timestamptz IS NULL OR created_at <= $3)
                AND ($4::text IS NULL OR last_error_code = $4)
                AND ($5::text IS NULL OR kind = $5)
        "#;

        let count_sql =
            format!("SELECT COUNT(*) AS total FROM outbox_dead_letters WHERE {FILTERS}");
        let count_row = sqlx::query(&count_sql)
            .bind(tenant_id.as_uuid())
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(filter.error_code.as_deref())
            .bind(filter.kind.as_deref())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_dead_letters", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| OutboxError::storage(format!("failed to read total: {e}")))?;
        tracing::Span::current().record("total", total);

        let list_sql = format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM outbox_dead_letters
            WHERE {FILTERS}
            ORDER BY created_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#
        );
        let rows = sqlx::query(&list_sql)
            .bind(tenant_id.as_uuid())
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(filter.error_code.as_deref())
            .bind(filter.kind.as_deref())
            .bind(i64::from(pagination.limit))
            .bind(i64::from(pagination.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        let items = rows
            .iter()
            .map(|row| {
                decode::<DeadLetterRow>("list_dead_letters", row).map(DeadLetterRecord::from)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(
            items,
            u64::try_from(total).unwrap_or(0),
            pagination,
        ))
    }

    async fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterRecord>, OutboxError> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM outbox_dead_letters WHERE tenant_id = $1 AND id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.map(|row| decode::<DeadLetterRow>("get_dead_letter", &row).map(DeadLetterRecord::from))
            .transpose()
    }

    /// One transaction: lock the dead letter, then the event row (or its
    /// dedupe slot), reset or re-insert the event, bump `replay_count`.
    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, dead_letter_id = %id, operator_id = %operator_id),
        err
    )]
    async fn apply_replay(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
        operator_id: OperatorId,
        now: DateTime<Utc>,
    ) -> Result<AppliedReplay, ReplayError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let dead_sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM outbox_dead_letters \
             WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        );
        let dead_letter = sqlx::query(&dead_sql)
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_dead_letter", e))?
            .map(|row| {
                decode::<DeadLetterRow>("lock_dead_letter", &row).map(DeadLetterRecord::from)
            })
            .transpose()?
            .ok_or(ReplayError::NotFound(id))?;
        let event_id = dead_letter.event_id;

        let event_sql = format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE tenant_id = $1 AND event_id = $2 FOR UPDATE"
        );
        let current = sqlx::query(&event_sql)
            .bind(tenant_id.as_uuid())
            .bind(event_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_event", e))?
            .map(|row| EventRecord::try_from(decode::<EventRow>("lock_event", &row)?))
            .transpose()?;

        let (transition, event) = match current {
            Some(record) => match record.status {
                EventStatus::Pending => return Err(ReplayError::AlreadyPending(event_id)),
                EventStatus::Sent => return Err(ReplayError::AlreadyDelivered(event_id)),
                EventStatus::Dead => {
                    let sql = format!(
                        r#"
                        UPDATE outbox_events
                        SET status = 'pending',
                            attempts = 0,
                            next_attempt_at = $3,
                            last_error = NULL,
                            lease_token = NULL,
                            leased_until = NULL,
                            updated_at = $3
                        WHERE tenant_id = $1 AND event_id = $2
                        RETURNING {EVENT_COLUMNS}
                        "#
                    );
                    let row = sqlx::query(&sql)
                        .bind(tenant_id.as_uuid())
                        .bind(event_id.as_uuid())
                        .bind(now)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("requeue_event", e))?;
                    let event = EventRecord::try_from(decode::<EventRow>("requeue_event", &row)?)?;
                    (ReplayTransition::Requeued, event)
                }
            },
            None => {
                let holder = sqlx::query(
                    "SELECT event_id, status FROM outbox_events \
                     WHERE tenant_id = $1 AND dedupe_key = $2 FOR UPDATE",
                )
                .bind(tenant_id.as_uuid())
                .bind(&dead_letter.dedupe_key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lock_dedupe_key", e))?;

                if let Some(holder) = holder {
                    let holder_id: uuid::Uuid = holder
                        .try_get("event_id")
                        .map_err(|e| {
                            OutboxError::storage(format!("failed to read event_id: {e}"))
                        })?;
                    let status: String = holder
                        .try_get("status")
                        .map_err(|e| OutboxError::storage(format!("failed to read status: {e}")))?;
                    let holder_id = EventId::from_uuid(holder_id);
                    return Err(if status == EventStatus::Sent.as_str() {
                        ReplayError::AlreadyDelivered(holder_id)
                    } else {
                        ReplayError::AlreadyPending(holder_id)
                    });
                }

                let sql = format!(
                    r#"
                    INSERT INTO outbox_events (
                        event_id, tenant_id, kind, payload, dedupe_key,
                        status, attempts, next_attempt_at, created_at, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $6, $6)
                    RETURNING {EVENT_COLUMNS}
                    "#
                );
                let row = sqlx::query(&sql)
                    .bind(event_id.as_uuid())
                    .bind(tenant_id.as_uuid())
                    .bind(&dead_letter.kind)
                    .bind(&dead_letter.payload)
                    .bind(&dead_letter.dedupe_key)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| {
                        if is_unique_violation(&e) {
                            // Lost a race against a concurrent enqueue or replay of the same key.
                            ReplayError::AlreadyPending(event_id)
                        } else {
                            map_sqlx_error("recreate_event", e).into()
                        }
                    })?;
                let event = EventRecord::try_from(decode::<EventRow>("recreate_event", &row)?)?;
                (ReplayTransition::Recreated, event)
            }
        };

        let stamp_sql = format!(
            r#"
            UPDATE outbox_dead_letters
            SET replay_count = replay_count + 1,
                last_replayed_at = $3,
                last_replayed_by = $4,
                updated_at = $3
            WHERE tenant_id = $1 AND id = $2
            RETURNING {DEAD_LETTER_COLUMNS}
            "#
        );
        let row = sqlx::query(&stamp_sql)
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .bind(now)
            .bind(operator_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("stamp_replay", e))?;
        let dead_letter = DeadLetterRecord::from(decode::<DeadLetterRow>("stamp_replay", &row)?);

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(AppliedReplay {
            transition,
            dead_letter,
            event,
        })
    }
}
