//! End-to-end delivery scenarios against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use fieldops_core::{Clock, DeadLetterId, EventId, ManualClock, OperatorId, TenantId};
use fieldops_outbox::{
    AssumeTargetExists, BatchReport, ClaimRequest, ClaimedEvent, DeadLetterDraft,
    DeadLetterFilter, DeadLetterRecord, DeadLetterStore, Dispatcher, DispatcherConfig,
    EnqueueOutcome, EventRecord, EventStatus, HandlerError, HandlerRegistry, HeartbeatReporter,
    HeartbeatStore, InMemoryOutboxStore, NewEvent, NoCircuit, Outbox, OutboxError, OutboxRunner,
    OutboxStore, Pagination, ReplayAuditLog, ReplayAuditOutcome, ReplayError, ReplayService,
    ReplayTargetCheck, ReplayTransition, Reschedule, RetryPolicy, RunnerConfig, RunnerStatus,
    codes,
};
use fieldops_outbox::query::BacklogStats;

const RUNNER: &str = "outbox-delivery";

struct World {
    store: Arc<InMemoryOutboxStore>,
    clock: ManualClock,
    tenant: TenantId,
}

impl World {
    fn new() -> Self {
        Self {
            store: InMemoryOutboxStore::arc(),
            clock: ManualClock::starting_now(),
            tenant: TenantId::new(),
        }
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    fn outbox(&self) -> Outbox<Arc<InMemoryOutboxStore>> {
        Outbox::new(self.store.clone(), self.clock())
    }

    fn runner<S: OutboxStore + 'static>(
        &self,
        store: S,
        handlers: HandlerRegistry,
        retry: RetryPolicy,
    ) -> OutboxRunner<S, Arc<InMemoryOutboxStore>> {
        let dispatcher = Dispatcher::new(
            store,
            handlers,
            Arc::new(NoCircuit),
            self.clock(),
            DispatcherConfig::default().with_retry(retry),
        );
        let heartbeat =
            HeartbeatReporter::new(self.store.clone(), RUNNER, "test-host:1", self.clock());
        OutboxRunner::new(dispatcher, heartbeat, self.clock(), RunnerConfig::default())
    }

    fn replay_service(
        &self,
        check: Arc<dyn ReplayTargetCheck>,
    ) -> ReplayService<Arc<InMemoryOutboxStore>, Arc<InMemoryOutboxStore>> {
        ReplayService::new(self.store.clone(), self.store.clone(), check, self.clock())
    }

    async fn event(&self, event_id: EventId) -> EventRecord {
        self.store
            .get_event(self.tenant, event_id)
            .await
            .unwrap()
            .expect("event exists")
    }

    async fn only_dead_letter(&self) -> DeadLetterRecord {
        let page = self
            .store
            .list_dead_letters(self.tenant, &DeadLetterFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        page.items.into_iter().next().unwrap()
    }
}

fn always_transient() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("email.*", |_, _| Err(HandlerError::transient("smtp 451")));
    handlers
}

#[tokio::test]
async fn welcome_email_is_delivered_once_after_two_transient_failures() {
    let world = World::new();
    let outbox = Arc::new(world.outbox());

    let payload = json!({"to": "new.tech@example.com", "template": "welcome"});
    let (a, b) = tokio::join!(
        outbox.enqueue(world.tenant, "email.welcome", payload.clone(), "welcome-42"),
        outbox.enqueue(world.tenant, "email.welcome", payload, "welcome-42"),
    );
    let (a, b): (EnqueueOutcome, EnqueueOutcome) = (a.unwrap(), b.unwrap());
    assert_eq!(a.record.event_id, b.record.event_id);
    assert_eq!(usize::from(a.inserted) + usize::from(b.inserted), 1);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("email.welcome", move |ctx, _| {
        assert_eq!(ctx.dedupe_key, "welcome-42");
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(HandlerError::transient("connection reset"))
        } else {
            Ok(())
        }
    });
    let runner = world.runner(
        world.store.clone(),
        handlers,
        RetryPolicy::fixed(8, Duration::from_secs(30)),
    );

    for _ in 0..3 {
        runner.run_once().await.unwrap();
        // Not yet due: a second run in the same instant must not retry early.
        let idle = runner.run_once().await.unwrap();
        assert_eq!(idle.claimed, 0);
        world.clock.advance(chrono::Duration::seconds(31));
    }

    let record = world.event(a.record.event_id).await;
    assert_eq!(record.status, EventStatus::Sent);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.last_error, None);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let beat = world.store.get_heartbeat(RUNNER).await.unwrap().unwrap();
    assert!(beat.last_success_at.is_some());
    assert_eq!(beat.consecutive_failures, 0);
}

#[tokio::test]
async fn exhausted_record_is_dead_lettered_and_replay_resets_it() {
    let world = World::new();
    let event = world
        .outbox()
        .enqueue(world.tenant, "email.invoice", json!({"to": "x@example.com"}), "inv-7")
        .await
        .unwrap()
        .record;

    let runner = world.runner(
        world.store.clone(),
        always_transient(),
        RetryPolicy::fixed(3, Duration::from_secs(10)),
    );

    let mut last = BatchReport::default();
    for _ in 0..3 {
        last = runner.run_once().await.unwrap();
        world.clock.advance(chrono::Duration::seconds(11));
    }
    assert_eq!(last.dead_lettered, 1);

    let record = world.event(event.event_id).await;
    assert_eq!(record.status, EventStatus::Dead);
    assert_eq!(record.attempts, 3);

    let dead = world.only_dead_letter().await;
    assert_eq!(dead.event_id, event.event_id);
    assert_eq!(dead.last_error_code, codes::MAX_ATTEMPTS_EXCEEDED);
    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.mode, "email");
    assert_eq!(dead.replay_count, 0);

    let operator = OperatorId::new();
    let service = world.replay_service(Arc::new(AssumeTargetExists));
    let outcome = service.replay(world.tenant, dead.id, operator).await.unwrap();

    assert_eq!(outcome.transition, ReplayTransition::Requeued);
    assert_eq!(outcome.dead_letter.replay_count, 1);
    assert_eq!(outcome.dead_letter.last_replayed_by, Some(operator));
    assert_eq!(outcome.event.attempts, 0);
    assert_eq!(outcome.event.status, EventStatus::Pending);
    assert_eq!(outcome.event.next_attempt_at, world.clock.now());

    let record = world.event(event.event_id).await;
    assert_eq!(record.attempts, 0);
    assert_eq!(record.last_error, None);

    let audit = service.audit_trail(world.tenant, dead.id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].outcome, ReplayAuditOutcome::Requeued);
    assert_eq!(audit[0].operator_id, operator);

    // Claimable again on the next cycle.
    let report = runner.run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
}

#[tokio::test]
async fn permanent_failure_dead_letters_after_one_attempt() {
    let world = World::new();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("webhook.*", |_, _| {
        Err(HandlerError::permanent("422 invalid payload").with_code("http_422"))
    });
    let event = world
        .outbox()
        .enqueue(
            world.tenant,
            "webhook.crm",
            json!({"url": "https://crm.example.com/hook"}),
            "crm-1",
        )
        .await
        .unwrap()
        .record;

    let runner = world.runner(world.store.clone(), handlers, RetryPolicy::default());
    let report = runner.run_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    assert_eq!(world.event(event.event_id).await.attempts, 1);
    let dead = world.only_dead_letter().await;
    assert_eq!(dead.last_error_code, "http_422");
    assert_eq!(dead.target_host.as_deref(), Some("crm.example.com"));
}

#[tokio::test]
async fn unknown_kind_is_dead_lettered_without_invoking_anything() {
    let world = World::new();
    world
        .outbox()
        .enqueue(world.tenant, "sms.reminder", json!({}), "sms-1")
        .await
        .unwrap();

    let runner = world.runner(world.store.clone(), always_transient(), RetryPolicy::default());
    runner.run_once().await.unwrap();

    let dead = world.only_dead_letter().await;
    assert_eq!(dead.last_error_code, codes::UNKNOWN_KIND);
    assert_eq!(dead.mode, "sms");
}

#[tokio::test]
async fn one_failing_record_does_not_stop_the_batch() {
    let world = World::new();
    let mut handlers = HandlerRegistry::new();
    handlers
        .register_fn("email.*", |_, _| Ok(()))
        .register_fn("webhook.*", |_, _| Err(HandlerError::permanent("gone")));

    let outbox = world.outbox();
    for i in 0..5 {
        let kind = if i == 2 { "webhook.crm" } else { "email.digest" };
        outbox
            .enqueue(world.tenant, kind, json!({}), &format!("batch-{i}"))
            .await
            .unwrap();
    }

    let runner = world.runner(world.store.clone(), handlers, RetryPolicy::default());
    let report = runner.run_once().await.unwrap();
    assert_eq!(report.claimed, 5);
    assert_eq!(report.sent, 4);
    assert_eq!(report.dead_lettered, 1);

    let stats = world.store.backlog_stats(world.tenant, world.clock.now()).await.unwrap();
    assert_eq!(
        stats,
        BacklogStats {
            pending: 0,
            due: 0,
            sent: 4,
            dead: 1
        }
    );
}

#[tokio::test]
async fn slow_batch_stops_invoking_handlers_once_the_lease_lapses() {
    let world = World::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let clock = world.clock.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("email.*", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        clock.advance(chrono::Duration::seconds(40));
        Ok(())
    });

    let outbox = world.outbox();
    for i in 0..3 {
        outbox
            .enqueue(world.tenant, "email.digest", json!({}), &format!("slow-{i}"))
            .await
            .unwrap();
    }

    let dispatcher = Dispatcher::new(
        world.store.clone(),
        handlers,
        Arc::new(NoCircuit),
        world.clock(),
        DispatcherConfig::default(),
    );
    let heartbeat =
        HeartbeatReporter::new(world.store.clone(), RUNNER, "test-host:1", world.clock());
    let config = RunnerConfig::default()
        .with_max_concurrent(1)
        .with_lease_duration(Duration::from_secs(60));
    let runner = OutboxRunner::new(dispatcher, heartbeat, world.clock(), config);

    let report = runner.run_once().await.unwrap();
    assert_eq!(report.claimed, 3);
    assert_eq!(report.sent, 2);
    assert_eq!(report.lease_lost, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The third record was never handed to a handler and is free for the next claimer.
    let reclaimed = world
        .store
        .claim_batch(&ClaimRequest::new(10), world.clock.now())
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].record.attempts, 0);
    assert_eq!(reclaimed[0].record.status, EventStatus::Pending);
}

struct TargetGone;

#[async_trait]
impl ReplayTargetCheck for TargetGone {
    async fn target_exists(&self, _dead_letter: &DeadLetterRecord) -> Result<bool, OutboxError> {
        Ok(false)
    }
}

async fn dead_letter_one(world: &World, key: &str) -> DeadLetterId {
    world
        .outbox()
        .enqueue(world.tenant, "email.welcome", json!({}), key)
        .await
        .unwrap();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("*", |_, _| Err(HandlerError::permanent("bad address")));
    world
        .runner(world.store.clone(), handlers, RetryPolicy::default())
        .run_once()
        .await
        .unwrap();
    world.only_dead_letter().await.id
}

#[tokio::test]
async fn replay_with_missing_target_is_rejected_and_audited() {
    let world = World::new();
    let id = dead_letter_one(&world, "welcome-9").await;

    let service = world.replay_service(Arc::new(TargetGone));
    let err = service
        .replay(world.tenant, id, OperatorId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ReplayError::TargetMissing { .. }));

    let dead = world.only_dead_letter().await;
    assert_eq!(dead.replay_count, 0);
    assert_eq!(world.event(dead.event_id).await.status, EventStatus::Dead);

    let audit = world.store.list_for_dead_letter(world.tenant, id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].outcome, ReplayAuditOutcome::Rejected);
}

#[tokio::test]
async fn replay_recreates_a_pruned_record_with_the_same_identity() {
    let world = World::new();
    let id = dead_letter_one(&world, "welcome-11").await;
    let dead = world.only_dead_letter().await;

    assert!(world.store.forget_event(world.tenant, dead.event_id).unwrap());

    let service = world.replay_service(Arc::new(AssumeTargetExists));
    let outcome = service
        .replay(world.tenant, id, OperatorId::new())
        .await
        .unwrap();

    assert_eq!(outcome.transition, ReplayTransition::Recreated);
    assert_eq!(outcome.event.event_id, dead.event_id);
    assert_eq!(outcome.event.dedupe_key, "welcome-11");

    let again = service
        .replay(world.tenant, id, OperatorId::new())
        .await
        .unwrap_err();
    assert_eq!(again, ReplayError::AlreadyPending(dead.event_id));

    let trail = service.audit_trail(world.tenant, id).await.unwrap();
    let outcomes: Vec<_> = trail.iter().map(|e| e.outcome).collect();
    assert_eq!(
        outcomes,
        vec![ReplayAuditOutcome::Recreated, ReplayAuditOutcome::Rejected]
    );
}

#[tokio::test]
async fn replay_is_tenant_scoped() {
    let world = World::new();
    let id = dead_letter_one(&world, "welcome-12").await;

    let service = world.replay_service(Arc::new(AssumeTargetExists));
    let err = service
        .replay(TenantId::new(), id, OperatorId::new())
        .await
        .unwrap_err();
    assert_eq!(err, ReplayError::NotFound(id));
}

/// Store whose claims can be made to fail.
struct FlakyClaims {
    inner: Arc<InMemoryOutboxStore>,
    failing: AtomicBool,
}

#[async_trait]
impl OutboxStore for FlakyClaims {
    async fn enqueue(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, OutboxError> {
        self.inner.enqueue(event, now).await
    }

    async fn get_event(
        &self,
        tenant_id: TenantId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, OutboxError> {
        self.inner.get_event(tenant_id, event_id).await
    }

    async fn find_by_dedupe_key(
        &self,
        tenant_id: TenantId,
        dedupe_key: &str,
    ) -> Result<Option<EventRecord>, OutboxError> {
        self.inner.find_by_dedupe_key(tenant_id, dedupe_key).await
    }

    async fn claim_batch(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedEvent>, OutboxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OutboxError::storage("connection refused"));
        }
        self.inner.claim_batch(request, now).await
    }

    async fn mark_sent(
        &self,
        claim: &ClaimedEvent,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError> {
        self.inner.mark_sent(claim, attempts, now).await
    }

    async fn reschedule(
        &self,
        claim: &ClaimedEvent,
        update: Reschedule,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, OutboxError> {
        self.inner.reschedule(claim, update, now).await
    }

    async fn mark_dead(
        &self,
        claim: &ClaimedEvent,
        draft: DeadLetterDraft,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRecord, OutboxError> {
        self.inner.mark_dead(claim, draft, now).await
    }

    async fn backlog_stats(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<BacklogStats, OutboxError> {
        self.inner.backlog_stats(tenant_id, now).await
    }
}

#[tokio::test]
async fn heartbeat_counts_failed_cycles_and_resets_on_success() {
    let world = World::new();
    let flaky = Arc::new(FlakyClaims {
        inner: world.store.clone(),
        failing: AtomicBool::new(true),
    });
    let runner = world.runner(flaky.clone(), always_transient(), RetryPolicy::default());

    for _ in 0..3 {
        assert!(runner.run_once().await.is_err());
        world.clock.advance(chrono::Duration::seconds(1));
    }

    let reporter = HeartbeatReporter::new(world.store.clone(), "monitor", "mon:1", world.clock());
    let health = reporter
        .health(RUNNER, chrono::Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.status, RunnerStatus::Failing);
    assert_eq!(health.heartbeat.consecutive_failures, 3);
    assert!(health.heartbeat.last_error.unwrap().contains("connection refused"));
    assert_eq!(health.heartbeat.last_success_at, None);

    flaky.failing.store(false, Ordering::SeqCst);
    // An empty cycle still counts as a successful heartbeat.
    let report = runner.run_once().await.unwrap();
    assert_eq!(report.claimed, 0);

    let beat = world.store.get_heartbeat(RUNNER).await.unwrap().unwrap();
    assert_eq!(beat.consecutive_failures, 0);
    assert_eq!(beat.last_success_at, Some(world.clock.now()));

    world.clock.advance(chrono::Duration::minutes(5));
    let health = reporter
        .health(RUNNER, chrono::Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.status, RunnerStatus::Stalled);
}

#[tokio::test]
async fn spawned_runner_delivers_and_stops_on_shutdown() {
    let world = World::new();
    let event = world
        .outbox()
        .enqueue(world.tenant, "email.welcome", json!({}), "spawned-1")
        .await
        .unwrap()
        .record;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("email.*", |_, _| Ok(()));
    let dispatcher = Dispatcher::new(
        world.store.clone(),
        handlers,
        Arc::new(NoCircuit),
        world.clock(),
        DispatcherConfig::default(),
    );
    let heartbeat =
        HeartbeatReporter::new(world.store.clone(), RUNNER, "test-host:1", world.clock());
    let config = RunnerConfig::default().with_poll_interval(Duration::from_millis(10));
    let handle = Arc::new(OutboxRunner::new(dispatcher, heartbeat, world.clock(), config)).spawn();

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if world.event(event.event_id).await.status == EventStatus::Sent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "runner did not deliver in time");

    handle.shutdown().await;
}
