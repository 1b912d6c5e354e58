//! `outbox_events`: enqueue, lease-based claim and post-dispatch transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use tracing::{Span, debug, instrument};

use fieldops_core::{EventId, TenantId};
use fieldops_outbox::{
    BacklogStats, ClaimRequest, ClaimedEvent, DeadLetterDraft, DeadLetterRecord, EnqueueOutcome,
    EventRecord, NewEvent, OutboxError, OutboxStore, Reschedule,
};

use super::rows::{DEAD_LETTER_COLUMNS, DeadLetterRow, EVENT_COLUMNS, EventRow, decode};
use super::{PostgresOutboxStore, is_unique_violation, map_sqlx_error, to_db_count};

/// Enqueue on a caller-supplied connection.
///
/// Pass `&mut *tx` to make the outbox write part of the business transaction
/// that produced the event: both commit or neither does.
#[instrument(
    skip(conn, event),
    fields(tenant_id = %event.tenant_id, kind = %event.kind, inserted),
    err
)]
pub async fn enqueue_on(
    conn: &mut PgConnection,
    event: NewEvent,
    now: DateTime<Utc>,
) -> Result<EnqueueOutcome, OutboxError> {
    event.validate()?;

    let insert = format!(
        r#"
        INSERT INTO outbox_events (
            event_id, tenant_id, kind, payload, dedupe_key,
            status, attempts, next_attempt_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $6, $6)
        ON CONFLICT (tenant_id, dedupe_key) DO NOTHING
        RETURNING {EVENT_COLUMNS}
        "#
    );

    let inserted = sqlx::query(&insert)
        .bind(EventId::new().as_uuid())
        .bind(event.tenant_id.as_uuid())
        .bind(&event.kind)
        .bind(&event.payload)
        .bind(&event.dedupe_key)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OutboxError::storage(format!("event id collision on enqueue: {e}"))
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

    if let Some(row) = inserted {
        Span::current().record("inserted", true);
        let record = EventRecord::try_from(decode::<EventRow>("enqueue", &row)?)?;
        return Ok(EnqueueOutcome::inserted(record));
    }

    Span::current().record("inserted", false);
    let existing = select_by_dedupe_key(conn, event.tenant_id, &event.dedupe_key)
        .await?
        .ok_or_else(|| {
            OutboxError::storage(format!(
                "dedupe key {} conflicted but no row was found",
                event.dedupe_key
            ))
        })?;
    debug!(event_id = %existing.event_id, "duplicate enqueue absorbed");
    Ok(EnqueueOutcome::existing(existing))
}

async fn select_by_dedupe_key(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    dedupe_key: &str,
) -> Result<Option<EventRecord>, OutboxError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE tenant_id = $1 AND dedupe_key = $2"
    );
    let row = sqlx::query(&sql)
        .bind(tenant_id.as_uuid())
        .bind(dedupe_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("find_by_dedupe_key", e))?;

    row.map(|row| EventRecord::try_from(decode::<EventRow>("find_by_dedupe_key", &row)?))
        .transpose()
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, OutboxError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        enqueue_on(&mut conn, event, now).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, event_id = %event_id), err)]
    async fn get_event(
        &self,
        tenant_id: TenantId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, OutboxError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE tenant_id = $1 AND event_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(event_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_event", e))?;

        row.map(|row| EventRecord::try_from(decode::<EventRow>("get_event", &row)?))
            .transpose()
    }

    async fn find_by_dedupe_key(
        &self,
        tenant_id: TenantId,
        dedupe_key: &str,
    ) -> Result<Option<EventRecord>, OutboxError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        select_by_dedupe_key(&mut conn, tenant_id, dedupe_key).await
    }

    /// Rank due rows per tenant, lock the winners with `SKIP LOCKED` so concurrent
    /// claimers partition the backlog, then stamp a fresh lease on each.
    #[instrument(
        skip(self, request),
        fields(limit = request.limit, per_tenant = request.tenant_cap(), claimed),
        err
    )]
    async fn claim_batch(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedEvent>, OutboxError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            WITH ranked AS (
                SELECT
                    event_id,
                    ROW_NUMBER() OVER (
                        PARTITION BY tenant_id
                        ORDER BY next_attempt_at, event_id
                    ) AS tenant_rank
                FROM outbox_events
                WHERE status = 'pending'
                    AND next_attempt_at <= $1
                    AND (leased_until IS NULL OR leased_until <= $1)
                    AND ($2::uuid IS NULL OR tenant_id = $2)
            ),
            candidates AS (
                SELECT e.event_id
                FROM outbox_events e
                JOIN ranked r ON r.event_id = e.event_id
                WHERE r.tenant_rank <= $3
                    AND e.status = 'pending'
                    AND (e.leased_until IS NULL OR e.leased_until <= $1)
                ORDER BY e.next_attempt_at, e.event_id
                LIMIT $4
                FOR UPDATE OF e SKIP LOCKED
            )
            UPDATE outbox_events e
            SET lease_token = gen_random_uuid(),
                leased_until = $5
            FROM candidates c
            WHERE e.event_id = c.event_id
            RETURNING {columns}
            "#,
            columns = EVENT_COLUMNS
                .split(", ")
                .map(|c| format!("e.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);
        let cap = i64::try_from(request.tenant_cap()).unwrap_or(i64::MAX);

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(request.tenant_id.map(|t| *t.as_uuid()))
            .bind(cap)
            .bind(limit)
            .bind(request.leased_until(now))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let row = decode::<EventRow>("claim_batch", &row)?;
            let (lease, leased_until) = row.lease().ok_or_else(|| {
                OutboxError::storage("claimed row returned without a lease".to_string())
            })?;
            claimed.push(ClaimedEvent {
                record: EventRecord::try_from(row)?,
                lease,
                leased_until,
            });
        }
        // RETURNING order is unspecified.
        claimed.sort_by(|a, b| {
            (a.record.next_attempt_at, a.record.event_id)
                .cmp(&(b.record.next_attempt_at, b.record.event_id))
        });

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, claim), fields(event_id = %claim.event_id()), err)]
    async fn mark_sent(
        &self,
        claim: &ClaimedEvent,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError> {
        let sql = format!(
            r#"
            UPDATE outbox_events
            SET status = 'sent',
                attempts = $4,
                last_error = NULL,
                lease_token = NULL,
                leased_until = NULL,
                updated_at = $5
            WHERE event_id = $1 AND tenant_id = $2 AND lease_token = $3 AND status = 'pending'
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(claim.event_id().as_uuid())
            .bind(claim.tenant_id().as_uuid())
            .bind(claim.lease.as_uuid())
            .bind(to_db_count(attempts))
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_sent", e))?
            .ok_or(OutboxError::LeaseLost(claim.event_id()))?;

        EventRecord::try_from(decode::<EventRow>("mark_sent", &row)?)
    }

    #[instrument(skip(self, claim, update), fields(event_id = %claim.event_id()), err)]
    async fn reschedule(
        &self,
        claim: &ClaimedEvent,
        update: Reschedule,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError> {
        let sql = format!(
            r#"
            UPDATE outbox_events
            SET next_attempt_at = $4,
                attempts = $5,
                last_error = $6,
                lease_token = NULL,
                leased_until = NULL,
                updated_at = $7
            WHERE event_id = $1 AND tenant_id = $2 AND lease_token = $3 AND status = 'pending'
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(claim.event_id().as_uuid())
            .bind(claim.tenant_id().as_uuid())
            .bind(claim.lease.as_uuid())
            .bind(update.next_attempt_at)
            .bind(to_db_count(update.attempts))
            .bind(update.last_error.as_deref())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reschedule", e))?
            .ok_or(OutboxError::LeaseLost(claim.event_id()))?;

        EventRecord::try_from(decode::<EventRow>("reschedule", &row)?)
    }

    #[instrument(
        skip(self, claim, draft),
        fields(event_id = %claim.event_id(), error_code = %draft.error_code),
        err
    )]
    async fn mark_dead(
        &self,
        claim: &ClaimedEvent,
        draft: DeadLetterDraft,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRecord, OutboxError> {
        if draft.event_id != claim.event_id() || draft.tenant_id != claim.tenant_id() {
            return Err(OutboxError::TenantIsolation(format!(
                "dead letter draft for {} does not match claim {}",
                draft.event_id,
                claim.event_id()
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'dead',
                attempts = $4,
                last_error = $5,
                lease_token = NULL,
                leased_until = NULL,
                updated_at = $6
            WHERE event_id = $1 AND tenant_id = $2 AND lease_token = $3 AND status = 'pending'
            "#,
        )
        .bind(claim.event_id().as_uuid())
        .bind(claim.tenant_id().as_uuid())
        .bind(claim.lease.as_uuid())
        .bind(to_db_count(draft.attempts))
        .bind(draft.last_error.as_deref())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_dead", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(OutboxError::LeaseLost(claim.event_id()));
        }

        let upsert = format!(
            r#"
            INSERT INTO outbox_dead_letters (
                id, event_id, tenant_id, kind, payload, dedupe_key, mode, target_host,
                attempts, last_error, last_error_code, replay_count, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, $12, $12)
            ON CONFLICT (tenant_id, event_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                mode = EXCLUDED.mode,
                target_host = EXCLUDED.target_host,
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                last_error_code = EXCLUDED.last_error_code,
                updated_at = EXCLUDED.updated_at
            RETURNING {DEAD_LETTER_COLUMNS}
            "#
        );
        let row = sqlx::query(&upsert)
            .bind(fieldops_core::DeadLetterId::new().as_uuid())
            .bind(draft.event_id.as_uuid())
            .bind(draft.tenant_id.as_uuid())
            .bind(&draft.kind)
            .bind(&draft.payload)
            .bind(&draft.dedupe_key)
            .bind(&draft.mode)
            .bind(draft.target_host.as_deref())
            .bind(to_db_count(draft.attempts))
            .bind(draft.last_error.as_deref())
            .bind(&draft.error_code)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_dead_letter", e))?;
        let record = DeadLetterRecord::from(decode::<DeadLetterRow>("upsert_dead_letter", &row)?);

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(record)
    }

    async fn backlog_stats(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<BacklogStats, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'pending' AND next_attempt_at <= $2) AS due,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'dead') AS dead
            FROM outbox_events
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("backlog_stats", e))?;

        let count = |column: &str| -> Result<u64, OutboxError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| OutboxError::storage(format!("failed to read {column}: {e}")))?;
            Ok(u64::try_from(value).unwrap_or(0))
        };

        Ok(BacklogStats {
            pending: count("pending")?,
            due: count("due")?,
            sent: count("sent")?,
            dead: count("dead")?,
        })
    }
}
