//! `fieldops-outbox`: reliable outbound event delivery.
//!
//! Side effects that must follow a committed business transaction (emails,
//! webhook/export pushes, notifications) are written to a tenant-scoped outbox
//! and delivered by independent runners.
//!
//! ## Components
//!
//! - `Outbox`: idempotent enqueue guarded by `(tenant_id, dedupe_key)`
//! - `OutboxStore`: persistence + lease-based claiming (in-memory here, Postgres in
//!   `fieldops-infra`)
//! - `Dispatcher`: invokes handlers, classifies failures, applies the `RetryPolicy`
//! - `ReplayService`: dead-letter triage and operator replay
//! - `HeartbeatReporter` / `OutboxRunner`: the batch loop and its liveness signal
//!
//! ## Guarantees
//!
//! - A record is never lost: claims are self-expiring leases, not a persisted status
//! - A record is never claimed by two runners at once
//! - One tenant's backlog cannot monopolize a batch (`ClaimRequest::per_tenant_limit`)

pub mod audit;
pub mod circuit;
pub mod dead_letter;
pub mod dispatcher;
pub mod enqueue;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod in_memory;
pub mod query;
pub mod record;
pub mod replay;
pub mod retry;
pub mod runner;
pub mod store;

pub use audit::{ReplayAuditEntry, ReplayAuditOutcome};
pub use circuit::{CircuitGate, ManualCircuitGate, NoCircuit};
pub use dead_letter::{DeadLetterDraft, DeadLetterRecord, codes};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use enqueue::Outbox;
pub use error::OutboxError;
pub use handler::{DeliveryContext, DeliveryHandler, HandlerError, HandlerRegistry};
pub use heartbeat::{
    CycleOutcome, HeartbeatReporter, HeartbeatUpdate, RunnerHealth, RunnerHeartbeat, RunnerStatus,
};
pub use in_memory::InMemoryOutboxStore;
pub use query::{BacklogStats, DeadLetterFilter, Page, Pagination};
pub use record::{ClaimedEvent, EnqueueOutcome, EventRecord, EventStatus, LeaseToken, NewEvent};
pub use replay::{
    AppliedReplay, AssumeTargetExists, ReplayError, ReplayOutcome, ReplayService,
    ReplayTargetCheck, ReplayTransition,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runner::{BatchReport, OutboxRunner, RunnerConfig, RunnerError, RunnerHandle};
pub use store::{
    ClaimRequest, DeadLetterStore, HeartbeatStore, OutboxStore, ReplayAuditLog, Reschedule,
};
