//! In-memory implementation of every outbox store trait.
//!
//! Intended for tests, local development, and deployments without a database.
//! All tables live behind a single lock so multi-table transitions (mark dead,
//! replay) are atomic exactly like their Postgres counterparts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fieldops_core::{DeadLetterId, EventId, OperatorId, TenantId};

use crate::audit::ReplayAuditEntry;
use crate::dead_letter::{DeadLetterDraft, DeadLetterRecord};
use crate::error::OutboxError;
use crate::heartbeat::{HeartbeatUpdate, RunnerHeartbeat};
use crate::query::{BacklogStats, DeadLetterFilter, Page, Pagination};
use crate::record::{ClaimedEvent, EnqueueOutcome, EventRecord, EventStatus, LeaseToken, NewEvent};
use crate::replay::{AppliedReplay, ReplayError, ReplayTransition};
use crate::store::{
    ClaimRequest, DeadLetterStore, HeartbeatStore, OutboxStore, ReplayAuditLog, Reschedule,
};

#[derive(Debug, Clone)]
struct Lease {
    token: LeaseToken,
    until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredEvent {
    record: EventRecord,
    lease: Option<Lease>,
}

impl StoredEvent {
    fn claimable(&self, now: DateTime<Utc>) -> bool {
        self.record.is_due(now) && self.lease.as_ref().is_none_or(|l| l.until <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    events: HashMap<EventId, StoredEvent>,
    dedupe: HashMap<(TenantId, String), EventId>,
    dead_letters: HashMap<DeadLetterId, DeadLetterRecord>,
    dead_letter_by_event: HashMap<(TenantId, EventId), DeadLetterId>,
    heartbeats: HashMap<String, RunnerHeartbeat>,
    audit: Vec<ReplayAuditEntry>,
}

impl State {
    /// The stored event behind `claim`, provided the claim still holds its lease.
    fn leased_mut(&mut self, claim: &ClaimedEvent) -> Result<&mut StoredEvent, OutboxError> {
        let event_id = claim.event_id();
        match self.events.get_mut(&event_id) {
            Some(stored)
                if stored.record.tenant_id == claim.tenant_id()
                    && stored.record.status == EventStatus::Pending
                    && stored.lease.as_ref().is_some_and(|l| l.token == claim.lease) =>
            {
                Ok(stored)
            }
            _ => Err(OutboxError::LeaseLost(event_id)),
        }
    }

    fn event_for_tenant(&self, tenant_id: TenantId, event_id: EventId) -> Option<&StoredEvent> {
        self.events
            .get(&event_id)
            .filter(|stored| stored.record.tenant_id == tenant_id)
    }
}

/// In-memory outbox (events, dead letters, heartbeats, replay audit).
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    state: RwLock<State>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drop an outbox record as a retention job would, leaving any dead letter
    /// in place. Returns whether a record was removed.
    pub fn forget_event(
        &self,
        tenant_id: TenantId,
        event_id: EventId,
    ) -> Result<bool, OutboxError> {
        let mut state = self.write()?;
        if state.event_for_tenant(tenant_id, event_id).is_none() {
            return Ok(false);
        }
        if let Some(stored) = state.events.remove(&event_id) {
            state
                .dedupe
                .remove(&(tenant_id, stored.record.dedupe_key.clone()));
        }
        Ok(true)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, OutboxError> {
        self.state
            .read()
            .map_err(|_| OutboxError::storage("outbox state lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, OutboxError> {
        self.state
            .write()
            .map_err(|_| OutboxError::storage("outbox state lock poisoned"))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, OutboxError> {
        event.validate()?;
        let mut state = self.write()?;

        let key = (event.tenant_id, event.dedupe_key.clone());
        if let Some(existing) = state.dedupe.get(&key).and_then(|id| state.events.get(id)) {
            return Ok(EnqueueOutcome::existing(existing.record.clone()));
        }

        let record = event.into_record(EventId::new(), now);
        state.dedupe.insert(key, record.event_id);
        state.events.insert(
            record.event_id,
            StoredEvent {
                record: record.clone(),
                lease: None,
            },
        );
        Ok(EnqueueOutcome::inserted(record))
    }

    async fn get_event(
        &self,
        tenant_id: TenantId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, OutboxError> {
        let state = self.read()?;
        Ok(state
            .event_for_tenant(tenant_id, event_id)
            .map(|stored| stored.record.clone()))
    }

    async fn find_by_dedupe_key(
        &self,
        tenant_id: TenantId,
        dedupe_key: &str,
    ) -> Result<Option<EventRecord>, OutboxError> {
        let state = self.read()?;
        Ok(state
            .dedupe
            .get(&(tenant_id, dedupe_key.to_string()))
            .and_then(|id| state.events.get(id))
            .map(|stored| stored.record.clone()))
    }

    async fn claim_batch(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedEvent>, OutboxError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.write()?;

        let mut candidates: Vec<(DateTime<Utc>, EventId, TenantId)> = state
            .events
            .values()
            .filter(|stored| stored.claimable(now))
            .filter(|stored| {
                request
                    .tenant_id
                    .is_none_or(|tenant| stored.record.tenant_id == tenant)
            })
            .map(|stored| {
                (
                    stored.record.next_attempt_at,
                    stored.record.event_id,
                    stored.record.tenant_id,
                )
            })
            .collect();
        candidates.sort();

        let cap = request.tenant_cap();
        let leased_until = request.leased_until(now);
        let mut per_tenant: HashMap<TenantId, usize> = HashMap::new();
        let mut claimed = Vec::new();

        for (_, event_id, tenant_id) in candidates {
            if claimed.len() >= request.limit {
                break;
            }
            let taken = per_tenant.entry(tenant_id).or_insert(0);
            if *taken >= cap {
                continue;
            }

            let Some(stored) = state.events.get_mut(&event_id) else {
                continue;
            };
            let token = LeaseToken::new();
            stored.lease = Some(Lease {
                token,
                until: leased_until,
            });
            *taken += 1;
            claimed.push(ClaimedEvent {
                record: stored.record.clone(),
                lease: token,
                leased_until,
            });
        }

        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        claim: &ClaimedEvent,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError> {
        let mut state = self.write()?;
        let stored = state.leased_mut(claim)?;

        stored.record.status = EventStatus::Sent;
        stored.record.attempts = attempts;
        stored.record.last_error = None;
        stored.record.updated_at = now;
        stored.lease = None;
        Ok(stored.record.clone())
    }

    async fn reschedule(
        &self,
        claim: &ClaimedEvent,
        update: Reschedule,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError> {
        let mut state = self.write()?;
        let stored = state.leased_mut(claim)?;

        stored.record.next_attempt_at = update.next_attempt_at;
        stored.record.attempts = update.attempts;
        stored.record.last_error = update.last_error;
        stored.record.updated_at = now;
        stored.lease = None;
        Ok(stored.record.clone())
    }

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

        let mut state = self.write()?;
        let stored = state.leased_mut(claim)?;
        stored.record.status = EventStatus::Dead;
        stored.record.attempts = draft.attempts;
        stored.record.last_error = draft.last_error.clone();
        stored.record.updated_at = now;
        stored.lease = None;

        let key = (draft.tenant_id, draft.event_id);
        let existing = state
            .dead_letter_by_event
            .get(&key)
            .and_then(|id| state.dead_letters.get(id))
            .cloned();

        let record = match existing {
            Some(mut record) => {
                record.absorb(draft, now);
                record
            }
            None => DeadLetterRecord::from_draft(draft, now),
        };

        state.dead_letter_by_event.insert(key, record.id);
        state.dead_letters.insert(record.id, record.clone());
        Ok(record)
    }

    async fn backlog_stats(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<BacklogStats, OutboxError> {
        let state = self.read()?;
        let mut stats = BacklogStats::default();
        for stored in state
            .events
            .values()
            .filter(|s| s.record.tenant_id == tenant_id)
        {
            match stored.record.status {
                EventStatus::Pending => {
                    stats.pending += 1;
                    if stored.record.next_attempt_at <= now {
                        stats.due += 1;
                    }
                }
                EventStatus::Sent => stats.sent += 1,
                EventStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryOutboxStore {
    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterRecord>, OutboxError> {
        let state = self.read()?;
        let mut matching: Vec<&DeadLetterRecord> = state
            .dead_letters
            .values()
            .filter(|r| r.tenant_id == tenant_id && filter.matches(r))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, total, pagination))
    }

    async fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterRecord>, OutboxError> {
        let state = self.read()?;
        Ok(state
            .dead_letters
            .get(&id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn apply_replay(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
        operator_id: OperatorId,
        now: DateTime<Utc>,
    ) -> Result<AppliedReplay, ReplayError> {
        let mut state = self.write()?;
        let mut dead_letter = state
            .dead_letters
            .get(&id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .ok_or(ReplayError::NotFound(id))?;

        let event_id = dead_letter.event_id;
        let transition = match state.event_for_tenant(tenant_id, event_id) {
            Some(stored) => match stored.record.status {
                EventStatus::Dead => ReplayTransition::Requeued,
                EventStatus::Pending => return Err(ReplayError::AlreadyPending(event_id)),
                EventStatus::Sent => return Err(ReplayError::AlreadyDelivered(event_id)),
            },
            None => {
                let key = (tenant_id, dead_letter.dedupe_key.clone());
                if let Some(holder) = state.dedupe.get(&key).and_then(|h| state.events.get(h)) {
                    return Err(match holder.record.status {
                        EventStatus::Sent => ReplayError::AlreadyDelivered(holder.record.event_id),
                        _ => ReplayError::AlreadyPending(holder.record.event_id),
                    });
                }
                ReplayTransition::Recreated
            }
        };

        let event = match transition {
            ReplayTransition::Requeued => {
                let Some(stored) = state.events.get_mut(&event_id) else {
                    return Err(OutboxError::not_found(format!("event {event_id}")).into());
                };
                stored.record.status = EventStatus::Pending;
                stored.record.attempts = 0;
                stored.record.next_attempt_at = now;
                stored.record.last_error = None;
                stored.record.updated_at = now;
                stored.lease = None;
                stored.record.clone()
            }
            ReplayTransition::Recreated => {
                let record = EventRecord {
                    event_id,
                    tenant_id,
                    kind: dead_letter.kind.clone(),
                    payload: dead_letter.payload.clone(),
                    dedupe_key: dead_letter.dedupe_key.clone(),
                    status: EventStatus::Pending,
                    attempts: 0,
                    next_attempt_at: now,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };
                state
                    .dedupe
                    .insert((tenant_id, record.dedupe_key.clone()), event_id);
                state.events.insert(
                    event_id,
                    StoredEvent {
                        record: record.clone(),
                        lease: None,
                    },
                );
                record
            }
        };

        dead_letter.record_replay(operator_id, now);
        state.dead_letters.insert(id, dead_letter.clone());

        Ok(AppliedReplay {
            transition,
            dead_letter,
            event,
        })
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryOutboxStore {
    async fn record_cycle(&self, update: &HeartbeatUpdate) -> Result<RunnerHeartbeat, OutboxError> {
        let mut state = self.write()?;
        let previous = state.heartbeats.remove(&update.runner_name);
        let beat = RunnerHeartbeat::apply(previous, update);
        state
            .heartbeats
            .insert(update.runner_name.clone(), beat.clone());
        Ok(beat)
    }

    async fn get_heartbeat(
        &self,
        runner_name: &str,
    ) -> Result<Option<RunnerHeartbeat>, OutboxError> {
        Ok(self.read()?.heartbeats.get(runner_name).cloned())
    }
}

#[async_trait]
impl ReplayAuditLog for InMemoryOutboxStore {
    async fn append(&self, entry: ReplayAuditEntry) -> Result<(), OutboxError> {
        self.write()?.audit.push(entry);
        Ok(())
    }

    async fn list_for_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Vec<ReplayAuditEntry>, OutboxError> {
        Ok(self
            .read()?
            .audit
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.dead_letter_id == dead_letter_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::dead_letter::codes;

    fn new_event(tenant: TenantId, key: &str) -> NewEvent {
        NewEvent::new(tenant, "email.welcome", json!({"to": "a@example.com"}), key).unwrap()
    }

    async fn seed(store: &InMemoryOutboxStore, tenant: TenantId, n: usize, now: DateTime<Utc>) {
        for i in 0..n {
            store
                .enqueue(new_event(tenant, &format!("k-{i}")), now)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn duplicate_enqueue_returns_existing_record() {
        let store = InMemoryOutboxStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        let first = store.enqueue(new_event(tenant, "welcome-42"), now).await.unwrap();
        let second = store.enqueue(new_event(tenant, "welcome-42"), now).await.unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.record.event_id, second.record.event_id);

        // Same key under another tenant is a different event.
        let other = store
            .enqueue(new_event(TenantId::new(), "welcome-42"), now)
            .await
            .unwrap();
        assert!(other.inserted);
    }

    #[tokio::test]
    async fn reads_are_tenant_scoped() {
        let store = InMemoryOutboxStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        let rec = store.enqueue(new_event(tenant, "k"), now).await.unwrap().record;

        assert!(store.get_event(tenant, rec.event_id).await.unwrap().is_some());
        assert!(store.get_event(TenantId::new(), rec.event_id).await.unwrap().is_none());
        assert!(store.find_by_dedupe_key(TenantId::new(), "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_next_attempt_and_skips_future_records() {
        let store = InMemoryOutboxStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        let late = store.enqueue(new_event(tenant, "late"), now).await.unwrap().record;
        let early = store
            .enqueue(new_event(tenant, "early"), now - chrono::Duration::seconds(10))
            .await
            .unwrap()
            .record;
        store
            .enqueue(new_event(tenant, "future"), now + chrono::Duration::seconds(10))
            .await
            .unwrap();

        let claimed = store.claim_batch(&ClaimRequest::new(10), now).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|c| c.event_id()).collect();
        assert_eq!(ids, vec![early.event_id, late.event_id]);
    }

    #[tokio::test]
    async fn leased_records_are_not_claimed_again_until_expiry() {
        let store = InMemoryOutboxStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        seed(&store, tenant, 3, now).await;

        let request = ClaimRequest::new(10).lease_duration(Duration::from_secs(30));
        assert_eq!(store.claim_batch(&request, now).await.unwrap().len(), 3);
        assert!(store.claim_batch(&request, now).await.unwrap().is_empty());

        let after_expiry = now + chrono::Duration::seconds(31);
        assert_eq!(store.claim_batch(&request, after_expiry).await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_overlap() {
        let store = InMemoryOutboxStore::arc();
        let now = Utc::now();
        for _ in 0..4 {
            seed(&store, TenantId::new(), 50, now).await;
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.claim_batch(&ClaimRequest::new(30), now).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for claim in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(claim.event_id()), "claimed twice");
            }
        }
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn per_tenant_limit_caps_a_noisy_tenant() {
        let store = InMemoryOutboxStore::new();
        let noisy = TenantId::new();
        let quiet = TenantId::new();
        let now = Utc::now();

        // The noisy backlog is older, so it would win a plain FIFO claim.
        seed(&store, noisy, 20, now - chrono::Duration::minutes(5)).await;
        seed(&store, quiet, 3, now).await;

        let claimed = store
            .claim_batch(&ClaimRequest::new(10).per_tenant_limit(5), now)
            .await
            .unwrap();

        let noisy_count = claimed.iter().filter(|c| c.tenant_id() == noisy).count();
        let quiet_count = claimed.iter().filter(|c| c.tenant_id() == quiet).count();
        assert_eq!(noisy_count, 5);
        assert_eq!(quiet_count, 3);
    }

    #[tokio::test]
    async fn stale_lease_cannot_update_record() {
        let store = InMemoryOutboxStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        seed(&store, tenant, 1, now).await;

        let request = ClaimRequest::new(1).lease_duration(Duration::from_secs(5));
        let stale = store.claim_batch(&request, now).await.unwrap().remove(0);
        let later = now + chrono::Duration::seconds(6);
        let fresh = store.claim_batch(&request, later).await.unwrap().remove(0);
        assert_eq!(stale.event_id(), fresh.event_id());

        let err = store.mark_sent(&stale, 1, later).await.unwrap_err();
        assert_eq!(err, OutboxError::LeaseLost(stale.event_id()));

        let sent = store.mark_sent(&fresh, 1, later).await.unwrap();
        assert_eq!(sent.status, EventStatus::Sent);
    }

    #[tokio::test]
    async fn mark_dead_upserts_one_dead_letter_per_event() {
        let store = InMemoryOutboxStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        seed(&store, tenant, 1, now).await;

        let claim = store.claim_batch(&ClaimRequest::new(1), now).await.unwrap().remove(0);
        let draft = DeadLetterDraft::from_record(
            &claim.record,
            1,
            Some("400".into()),
            codes::PERMANENT_FAILURE,
        );
        let first = store.mark_dead(&claim, draft, now).await.unwrap();

        let applied = store
            .apply_replay(tenant, first.id, OperatorId::new(), now)
            .await
            .unwrap();
        assert_eq!(applied.transition, ReplayTransition::Requeued);

        let claim = store.claim_batch(&ClaimRequest::new(1), now).await.unwrap().remove(0);
        let draft = DeadLetterDraft::from_record(
            &claim.record,
            1,
            Some("400".into()),
            codes::PERMANENT_FAILURE,
        );
        let second = store.mark_dead(&claim, draft, now).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.replay_count, 1);
        let page = store
            .list_dead_letters(tenant, &DeadLetterFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn replay_refuses_pending_and_recreates_pruned_records() {
        let store = InMemoryOutboxStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        seed(&store, tenant, 1, now).await;

        let claim = store.claim_batch(&ClaimRequest::new(1), now).await.unwrap().remove(0);
        let draft =
            DeadLetterDraft::from_record(&claim.record, 8, None, codes::MAX_ATTEMPTS_EXCEEDED);
        let dead = store.mark_dead(&claim, draft, now).await.unwrap();
        let operator = OperatorId::new();

        store.apply_replay(tenant, dead.id, operator, now).await.unwrap();
        let again = store.apply_replay(tenant, dead.id, operator, now).await.unwrap_err();
        assert_eq!(again, ReplayError::AlreadyPending(dead.event_id));

        assert!(store.forget_event(tenant, dead.event_id).unwrap());
        let applied = store.apply_replay(tenant, dead.id, operator, now).await.unwrap();
        assert_eq!(applied.transition, ReplayTransition::Recreated);
        assert_eq!(applied.event.event_id, dead.event_id);
        assert_eq!(applied.event.attempts, 0);
        assert_eq!(applied.dead_letter.replay_count, 2);

        let other_tenant = store
            .apply_replay(TenantId::new(), dead.id, operator, now)
            .await
            .unwrap_err();
        assert_eq!(other_tenant, ReplayError::NotFound(dead.id));
    }

    #[tokio::test]
    async fn backlog_stats_count_due_pending() {
        let store = InMemoryOutboxStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        seed(&store, tenant, 2, now).await;
        store
            .enqueue(new_event(tenant, "later"), now + chrono::Duration::hours(1))
            .await
            .unwrap();

        let claim = store.claim_batch(&ClaimRequest::new(1), now).await.unwrap().remove(0);
        store.mark_sent(&claim, 1, now).await.unwrap();

        let stats = store.backlog_stats(tenant, now).await.unwrap();
        assert_eq!(
            stats,
            BacklogStats {
                pending: 2,
                due: 1,
                sent: 1,
                dead: 0
            }
        );
    }
}
