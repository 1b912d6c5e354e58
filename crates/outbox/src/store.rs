//! Storage boundaries of the delivery engine.
//!
//! Implementations: `InMemoryOutboxStore` (tests/dev) and the Postgres stores
//! in `fieldops-infra`. Every read and write is tenant-scoped except the claim
//! scan, which spans tenants but caps each tenant's share of a batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fieldops_core::{DeadLetterId, EventId, OperatorId, TenantId};

use crate::audit::ReplayAuditEntry;
use crate::dead_letter::{DeadLetterDraft, DeadLetterRecord};
use crate::error::OutboxError;
use crate::heartbeat::{HeartbeatUpdate, RunnerHeartbeat};
use crate::query::{BacklogStats, DeadLetterFilter, Page, Pagination};
use crate::record::{ClaimedEvent, EnqueueOutcome, EventRecord, NewEvent};
use crate::replay::{AppliedReplay, ReplayError};

/// Parameters of one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Maximum records in the batch.
    pub limit: usize,
    /// Maximum records a single tenant may contribute to the batch.
    pub per_tenant_limit: Option<usize>,
    /// Restrict the claim to one tenant.
    pub tenant_id: Option<TenantId>,
    /// How long the claim stays exclusive if the claimer never reports back.
    pub lease_duration: Duration,
}

impl ClaimRequest {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            per_tenant_limit: None,
            tenant_id: None,
            lease_duration: Duration::from_secs(60),
        }
    }

    pub fn per_tenant_limit(mut self, limit: usize) -> Self {
        self.per_tenant_limit = Some(limit);
        self
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Effective per-tenant cap (never above `limit`).
    pub fn tenant_cap(&self) -> usize {
        self.per_tenant_limit.unwrap_or(self.limit).min(self.limit)
    }

    pub fn leased_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// New scheduling state for a record that stays `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reschedule {
    pub next_attempt_at: DateTime<Utc>,
    /// Attempt count to persist (unchanged for circuit deferrals).
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Live outbox table: enqueue, claim, and post-dispatch transitions.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a `pending` record unless `(tenant_id, dedupe_key)` exists, in which
    /// case the existing record is returned unchanged.
    async fn enqueue(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, OutboxError>;

    async fn get_event(
        &self,
        tenant_id: TenantId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, OutboxError>;

    async fn find_by_dedupe_key(
        &self,
        tenant_id: TenantId,
        dedupe_key: &str,
    ) -> Result<Option<EventRecord>, OutboxError>;

    /// Atomically lease up to `request.limit` due records, oldest
    /// `next_attempt_at` first. Two concurrent calls never return the same record.
    async fn claim_batch(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedEvent>, OutboxError>;

    /// `pending → sent`, clearing `last_error` and the lease.
    async fn mark_sent(
        &self,
        claim: &ClaimedEvent,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError>;

    /// Keep the record `pending` with a new schedule and release the lease.
    async fn reschedule(
        &self,
        claim: &ClaimedEvent,
        update: Reschedule,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError>;

    /// `pending → dead` and create/update the dead-letter entry, atomically.
    async fn mark_dead(
        &self,
        claim: &ClaimedEvent,
        draft: DeadLetterDraft,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRecord, OutboxError>;

    async fn backlog_stats(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<BacklogStats, OutboxError>;
}

/// Dead-letter archive: triage reads and the replay transition.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Newest first.
    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterRecord>, OutboxError>;

    async fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterRecord>, OutboxError>;

    /// Make the archived event claimable again and stamp the replay, atomically.
    async fn apply_replay(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
        operator_id: OperatorId,
        now: DateTime<Utc>,
    ) -> Result<AppliedReplay, ReplayError>;
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Upsert the runner's row with the outcome of one cycle.
    async fn record_cycle(&self, update: &HeartbeatUpdate) -> Result<RunnerHeartbeat, OutboxError>;

    async fn get_heartbeat(&self, runner_name: &str)
    -> Result<Option<RunnerHeartbeat>, OutboxError>;
}

/// Append-only replay audit log. There is no update or delete.
#[async_trait]
pub trait ReplayAuditLog: Send + Sync {
    async fn append(&self, entry: ReplayAuditEntry) -> Result<(), OutboxError>;

    /// Oldest first.
    async fn list_for_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Vec<ReplayAuditEntry>, OutboxError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn enqueue(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, OutboxError> {
        (**self).enqueue(event, now).await
    }

    async fn get_event(
        &self,
        tenant_id: TenantId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, OutboxError> {
        (**self).get_event(tenant_id, event_id).await
    }

    async fn find_by_dedupe_key(
        &self,
        tenant_id: TenantId,
        dedupe_key: &str,
    ) -> Result<Option<EventRecord>, OutboxError> {
        (**self).find_by_dedupe_key(tenant_id, dedupe_key).await
    }

    async fn claim_batch(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedEvent>, OutboxError> {
        (**self).claim_batch(request, now).await
    }

    async fn mark_sent(
        &self,
        claim: &ClaimedEvent,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError> {
        (**self).mark_sent(claim, attempts, now).await
    }

    async fn reschedule(
        &self,
        claim: &ClaimedEvent,
        update: Reschedule,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError> {
        (**self).reschedule(claim, update, now).await
    }

    async fn mark_dead(
        &self,
        claim: &ClaimedEvent,
        draft: DeadLetterDraft,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRecord, OutboxError> {
        (**self).mark_dead(claim, draft, now).await
    }

    async fn backlog_stats(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<BacklogStats, OutboxError> {
        (**self).backlog_stats(tenant_id, now).await
    }
}

#[async_trait]
impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterRecord>, OutboxError> {
        (**self).list_dead_letters(tenant_id, filter, pagination).await
    }

    async fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterRecord>, OutboxError> {
        (**self).get_dead_letter(tenant_id, id).await
    }

    async fn apply_replay(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
        operator_id: OperatorId,
        now: DateTime<Utc>,
    ) -> Result<AppliedReplay, ReplayError> {
        (**self).apply_replay(tenant_id, id, operator_id, now).await
    }
}

#[async_trait]
impl<S> HeartbeatStore for Arc<S>
where
    S: HeartbeatStore + ?Sized,
{
    async fn record_cycle(&self, update: &HeartbeatUpdate) -> Result<RunnerHeartbeat, OutboxError> {
        (**self).record_cycle(update).await
    }

    async fn get_heartbeat(
        &self,
        runner_name: &str,
    ) -> Result<Option<RunnerHeartbeat>, OutboxError> {
        (**self).get_heartbeat(runner_name).await
    }
}

#[async_trait]
impl<S> ReplayAuditLog for Arc<S>
where
    S: ReplayAuditLog + ?Sized,
{
    async fn append(&self, entry: ReplayAuditEntry) -> Result<(), OutboxError> {
        (**self).append(entry).await
    }

    async fn list_for_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Vec<ReplayAuditEntry>, OutboxError> {
        (**self).list_for_dead_letter(tenant_id, dead_letter_id).await
    }
}
