//! Replay audit trail.
//!
//! Entries are immutable once written; `ReplayAuditLog` only appends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fieldops_core::{DeadLetterId, EventId, OperatorId, TenantId};

/// How an operator replay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayAuditOutcome {
    /// The existing outbox record was reset to `pending`.
    Requeued,
    /// The outbox record was gone and was re-created as `pending`.
    Recreated,
    /// The replay was refused (target missing, already pending, already delivered).
    Rejected,
}

impl ReplayAuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requeued => "requeued",
            Self::Recreated => "recreated",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requeued" => Some(Self::Requeued),
            "recreated" => Some(Self::Recreated),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayAuditEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub dead_letter_id: DeadLetterId,
    pub event_id: EventId,
    pub operator_id: OperatorId,
    pub outcome: ReplayAuditOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ReplayAuditEntry {
    pub fn new(
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
        event_id: EventId,
        operator_id: OperatorId,
        outcome: ReplayAuditOutcome,
        detail: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            dead_letter_id,
            event_id,
            operator_id,
            outcome,
            detail,
            recorded_at,
        }
    }
}
