//! Outbox record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fieldops_core::{DomainError, EventId, TenantId};

/// Maximum accepted length for `kind` and `dedupe_key`.
pub const MAX_KEY_LEN: usize = 255;

/// Delivery status of an outbox record.
///
/// There is deliberately no `processing` state: an in-flight record is still
/// `pending`, protected only by a self-expiring lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for delivery (initial, and after a transient failure).
    Pending,
    /// Delivered successfully (terminal).
    Sent,
    /// Undeliverable, archived in the dead-letter sink (terminal until replay).
    Dead,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Sent => "sent",
            EventStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Dead)
    }
}

impl core::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "sent" => Ok(EventStatus::Sent),
            "dead" => Ok(EventStatus::Dead),
            other => Err(DomainError::validation(format!("unknown event status: {other}"))),
        }
    }
}

/// A request to enqueue a logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub tenant_id: TenantId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
}

impl NewEvent {
    /// Build and validate an enqueue request.
    pub fn new(
        tenant_id: TenantId,
        kind: impl Into<String>,
        payload: serde_json::Value,
        dedupe_key: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let event = Self {
            tenant_id,
            kind: kind.into(),
            payload,
            dedupe_key: dedupe_key.into(),
        };
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.kind.trim().is_empty() {
            return Err(DomainError::validation("kind must not be empty"));
        }
        if self.dedupe_key.trim().is_empty() {
            return Err(DomainError::validation("dedupe_key must not be empty"));
        }
        if self.kind.len() > MAX_KEY_LEN {
            return Err(DomainError::validation(format!(
                "kind exceeds {MAX_KEY_LEN} bytes"
            )));
        }
        if self.dedupe_key.len() > MAX_KEY_LEN {
            return Err(DomainError::validation(format!(
                "dedupe_key exceeds {MAX_KEY_LEN} bytes"
            )));
        }
        Ok(())
    }

    /// Materialize the initial `pending` record.
    pub fn into_record(self, event_id: EventId, now: DateTime<Utc>) -> EventRecord {
        EventRecord {
            event_id,
            tenant_id: self.tenant_id,
            kind: self.kind,
            payload: self.payload,
            dedupe_key: self.dedupe_key,
            status: EventStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
    pub status: EventStatus,
    /// Dispatch attempts so far (success or failure; circuit deferrals excluded).
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Due for claiming at `now` (ignoring leases, which the store tracks).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.next_attempt_at <= now
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub record: EventRecord,
    /// `false` when the dedupe key already existed and the existing record was returned.
    pub inserted: bool,
}

impl EnqueueOutcome {
    pub fn inserted(record: EventRecord) -> Self {
        Self {
            record,
            inserted: true,
        }
    }

    pub fn existing(record: EventRecord) -> Self {
        Self {
            record,
            inserted: false,
        }
    }
}

/// Opaque lease token stamped on a record by a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A record claimed for one dispatch attempt.
///
/// `record` reflects the state at claim time; every follow-up write must present
/// `lease` and fails with `OutboxError::LeaseLost` once another runner re-claimed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEvent {
    pub record: EventRecord,
    pub lease: LeaseToken,
    pub leased_until: DateTime<Utc>,
}

impl ClaimedEvent {
    pub fn event_id(&self) -> EventId {
        self.record.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.record.tenant_id
    }
}
