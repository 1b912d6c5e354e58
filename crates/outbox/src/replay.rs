//! Dead-letter triage and operator replay.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use fieldops_core::{Clock, DeadLetterId, EventId, OperatorId, TenantId};

use crate::audit::{ReplayAuditEntry, ReplayAuditOutcome};
use crate::dead_letter::DeadLetterRecord;
use crate::error::OutboxError;
use crate::query::{DeadLetterFilter, Page, Pagination};
use crate::record::EventRecord;
use crate::store::{DeadLetterStore, ReplayAuditLog};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("dead letter {0} not found")]
    NotFound(DeadLetterId),

    /// The tenant or the resource the event refers to no longer exists.
    #[error("replay target missing for event {event_id}: {reason}")]
    TargetMissing { event_id: EventId, reason: String },

    /// The event was already replayed and has not reached a terminal state yet.
    #[error("event {0} is already pending delivery")]
    AlreadyPending(EventId),

    /// The event was delivered after all; replaying would repeat the side effect.
    #[error("event {0} was already delivered")]
    AlreadyDelivered(EventId),

    #[error(transparent)]
    Store(#[from] OutboxError),
}

/// How the archived event was made claimable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayTransition {
    /// The `dead` outbox record was reset to `pending`.
    Requeued,
    /// The outbox record had been pruned and was inserted again.
    Recreated,
}

impl ReplayTransition {
    fn audit_outcome(self) -> ReplayAuditOutcome {
        match self {
            Self::Requeued => ReplayAuditOutcome::Requeued,
            Self::Recreated => ReplayAuditOutcome::Recreated,
        }
    }
}

/// Result of the store-side replay transition.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedReplay {
    pub transition: ReplayTransition,
    /// Dead letter after `replay_count` was incremented.
    pub dead_letter: DeadLetterRecord,
    /// The `pending` record that will be claimed next.
    pub event: EventRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayOutcome {
    pub transition: ReplayTransition,
    pub dead_letter: DeadLetterRecord,
    pub event: EventRecord,
    /// `None` when the audit append failed (the replay itself stands).
    pub audit_entry: Option<ReplayAuditEntry>,
}

/// Decides whether a dead letter may be replayed at all.
#[async_trait]
pub trait ReplayTargetCheck: Send + Sync {
    /// `Ok(false)` when the tenant or referenced resource is gone.
    async fn target_exists(&self, dead_letter: &DeadLetterRecord) -> Result<bool, OutboxError>;
}

/// Accepts every replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeTargetExists;

#[async_trait]
impl ReplayTargetCheck for AssumeTargetExists {
    async fn target_exists(&self, _dead_letter: &DeadLetterRecord) -> Result<bool, OutboxError> {
        Ok(true)
    }
}

/// Operator-facing dead-letter service.
pub struct ReplayService<D, A> {
    dead_letters: D,
    audit: A,
    target_check: Arc<dyn ReplayTargetCheck>,
    clock: Arc<dyn Clock>,
}

impl<D, A> ReplayService<D, A>
where
    D: DeadLetterStore,
    A: ReplayAuditLog,
{
    pub fn new(
        dead_letters: D,
        audit: A,
        target_check: Arc<dyn ReplayTargetCheck>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dead_letters,
            audit,
            target_check,
            clock,
        }
    }

    pub async fn list(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterRecord>, OutboxError> {
        self.dead_letters
            .list_dead_letters(tenant_id, filter, pagination)
            .await
    }

    pub async fn get(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterRecord>, OutboxError> {
        self.dead_letters.get_dead_letter(tenant_id, id).await
    }

    pub async fn audit_trail(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Vec<ReplayAuditEntry>, OutboxError> {
        self.audit.list_for_dead_letter(tenant_id, id).await
    }

    /// Put a dead-lettered event back into the delivery pipeline.
    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, dead_letter_id = %id, operator_id = %operator_id),
        err
    )]
    pub async fn replay(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
        operator_id: OperatorId,
    ) -> Result<ReplayOutcome, ReplayError> {
        let dead_letter = self
            .dead_letters
            .get_dead_letter(tenant_id, id)
            .await?
            .ok_or(ReplayError::NotFound(id))?;

        if !self.target_check.target_exists(&dead_letter).await? {
            let err = ReplayError::TargetMissing {
                event_id: dead_letter.event_id,
                reason: format!("target of {} no longer exists", dead_letter.kind),
            };
            self.record_rejection(&dead_letter, operator_id, &err).await;
            return Err(err);
        }

        let now = self.clock.now();
        let applied = match self
            .dead_letters
            .apply_replay(tenant_id, id, operator_id, now)
            .await
        {
            Ok(applied) => applied,
            Err(
                err @ (ReplayError::AlreadyPending(_)
                | ReplayError::AlreadyDelivered(_)
                | ReplayError::TargetMissing { .. }),
            ) => {
                self.record_rejection(&dead_letter, operator_id, &err).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        info!(
            event_id = %applied.event.event_id,
            transition = ?applied.transition,
            replay_count = applied.dead_letter.replay_count,
            "dead letter replayed"
        );

        let entry = ReplayAuditEntry::new(
            tenant_id,
            id,
            applied.event.event_id,
            operator_id,
            applied.transition.audit_outcome(),
            None,
            now,
        );
        let audit_entry = match self.audit.append(entry.clone()).await {
            Ok(()) => Some(entry),
            Err(e) => {
                warn!(error = %e, "failed to append replay audit entry");
                None
            }
        };

        Ok(ReplayOutcome {
            transition: applied.transition,
            dead_letter: applied.dead_letter,
            event: applied.event,
            audit_entry,
        })
    }

    async fn record_rejection(
        &self,
        dead_letter: &DeadLetterRecord,
        operator_id: OperatorId,
        reason: &ReplayError,
    ) {
        let entry = ReplayAuditEntry::new(
            dead_letter.tenant_id,
            dead_letter.id,
            dead_letter.event_id,
            operator_id,
            ReplayAuditOutcome::Rejected,
            Some(reason.to_string()),
            self.clock.now(),
        );
        if let Err(e) = self.audit.append(entry).await {
            warn!(error = %e, "failed to append replay audit entry");
        }
    }
}
