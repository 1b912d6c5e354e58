// SQLx row types

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use fieldops_core::{DeadLetterId, EventId, OperatorId, TenantId};
use fieldops_outbox::{
    DeadLetterRecord, EventRecord, EventStatus, LeaseToken, OutboxError, ReplayAuditEntry,
    ReplayAuditOutcome, RunnerHeartbeat,
};

use super::from_db_count;

pub(crate) const EVENT_COLUMNS: &str = "event_id, tenant_id, kind, payload, dedupe_key, status, \
     attempts, next_attempt_at, last_error, lease_token, leased_until, created_at, updated_at";

pub(crate) const DEAD_LETTER_COLUMNS: &str = "id, event_id, tenant_id, kind, payload, dedupe_key, \
     mode, target_host, attempts, last_error, last_error_code, replay_count, last_replayed_at, \
     last_replayed_by, created_at, updated_at";

#[derive(Debug)]
pub(crate) struct EventRow {
    event_id: Uuid,
    tenant_id: Uuid,
    kind: String,
    payload: serde_json::Value,
    dedupe_key: String,
    status: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    pub(crate) lease_token: Option<Uuid>,
    pub(crate) leased_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            dedupe_key: row.try_get("dedupe_key")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            lease_token: row.try_get("lease_token")?,
            leased_until: row.try_get("leased_until")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl EventRow {
    pub(crate) fn lease(&self) -> Option<(LeaseToken, DateTime<Utc>)> {
        Some((LeaseToken::from_uuid(self.lease_token?), self.leased_until?))
    }
}

impl TryFrom<EventRow> for EventRecord {
    type Error = OutboxError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let status: EventStatus = row
            .status
            .parse()
            .map_err(|e| {
                OutboxError::storage(format!("corrupt outbox row {}: {e}", row.event_id))
            })?;

        Ok(EventRecord {
            event_id: EventId::from_uuid(row.event_id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            kind: row.kind,
            payload: row.payload,
            dedupe_key: row.dedupe_key,
            status,
            attempts: from_db_count(row.attempts),
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
pub(crate) struct DeadLetterRow {
    id: Uuid,
    event_id: Uuid,
    tenant_id: Uuid,
    kind: String,
    payload: serde_json::Value,
    dedupe_key: String,
    mode: String,
    target_host: Option<String>,
    attempts: i32,
    last_error: Option<String>,
    last_error_code: String,
    replay_count: i32,
    last_replayed_at: Option<DateTime<Utc>>,
    last_replayed_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            dedupe_key: row.try_get("dedupe_key")?,
            mode: row.try_get("mode")?,
            target_host: row.try_get("target_host")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            last_error_code: row.try_get("last_error_code")?,
            replay_count: row.try_get("replay_count")?,
            last_replayed_at: row.try_get("last_replayed_at")?,
            last_replayed_by: row.try_get("last_replayed_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<DeadLetterRow> for DeadLetterRecord {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetterRecord {
            id: DeadLetterId::from_uuid(row.id),
            event_id: EventId::from_uuid(row.event_id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            kind: row.kind,
            payload: row.payload,
            dedupe_key: row.dedupe_key,
            mode: row.mode,
            target_host: row.target_host,
            attempts: from_db_count(row.attempts),
            last_error: row.last_error,
            last_error_code: row.last_error_code,
            replay_count: from_db_count(row.replay_count),
            last_replayed_at: row.last_replayed_at,
            last_replayed_by: row.last_replayed_by.map(OperatorId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug)]
pub(crate) struct HeartbeatRow {
    runner_name: String,
    last_heartbeat_at: DateTime<Utc>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    runner_instance_id: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for HeartbeatRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(HeartbeatRow {
            runner_name: row.try_get("runner_name")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            last_success_at: row.try_get("last_success_at")?,
            last_error: row.try_get("last_error")?,
            last_error_at: row.try_get("last_error_at")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            runner_instance_id: row.try_get("runner_instance_id")?,
        })
    }
}

impl From<HeartbeatRow> for RunnerHeartbeat {
    fn from(row: HeartbeatRow) -> Self {
        RunnerHeartbeat {
            runner_name: row.runner_name,
            last_heartbeat_at: row.last_heartbeat_at,
            last_success_at: row.last_success_at,
            last_error: row.last_error,
            last_error_at: row.last_error_at,
            consecutive_failures: from_db_count(row.consecutive_failures),
            runner_instance_id: row.runner_instance_id,
        }
    }
}

#[derive(Debug)]
pub(crate) struct AuditRow {
    id: Uuid,
    tenant_id: Uuid,
    dead_letter_id: Uuid,
    event_id: Uuid,
    operator_id: Uuid,
    outcome: String,
    detail: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AuditRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AuditRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            dead_letter_id: row.try_get("dead_letter_id")?,
            event_id: row.try_get("event_id")?,
            operator_id: row.try_get("operator_id")?,
            outcome: row.try_get("outcome")?,
            detail: row.try_get("detail")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl TryFrom<AuditRow> for ReplayAuditEntry {
    type Error = OutboxError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let outcome = ReplayAuditOutcome::parse(&row.outcome).ok_or_else(|| {
            OutboxError::storage(format!("corrupt audit row {}: outcome {}", row.id, row.outcome))
        })?;

        Ok(ReplayAuditEntry {
            id: row.id,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            dead_letter_id: DeadLetterId::from_uuid(row.dead_letter_id),
            event_id: EventId::from_uuid(row.event_id),
            operator_id: OperatorId::from_uuid(row.operator_id),
            outcome,
            detail: row.detail,
            recorded_at: row.recorded_at,
        })
    }
}

/// Decode a row, reporting failures against `operation`.
pub(crate) fn decode<T>(operation: &str, row: &PgRow) -> Result<T, OutboxError>
where
    T: for<'r> sqlx::FromRow<'r, PgRow>,
{
    T::from_row(row)
        .map_err(|e| OutboxError::storage(format!("failed to deserialize row in {operation}: {e}")))
}
