//! Dead-letter archive records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldops_core::{DeadLetterId, EventId, OperatorId, TenantId};

use crate::record::EventRecord;

/// Machine-readable error codes stamped on dead letters.
pub mod codes {
    /// Transient failures reached the attempt ceiling.
    pub const MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";
    /// No handler registered for the record's kind.
    pub const UNKNOWN_KIND: &str = "unknown_kind";
    /// Handler rejected the payload without a more specific code.
    pub const PERMANENT_FAILURE: &str = "permanent_failure";
    /// Handler reported a transient failure without a more specific code.
    pub const TRANSIENT_FAILURE: &str = "transient_failure";
    /// Handler exceeded the dispatch timeout.
    pub const TIMEOUT: &str = "timeout";
}

/// Terminal-failure archive entry for one logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: DeadLetterId,
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
    /// Delivery channel (`email`, `webhook`, `export`, ...).
    pub mode: String,
    /// Downstream host, diagnostic only.
    pub target_host: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_error_code: String,
    pub replay_count: u32,
    pub last_replayed_at: Option<DateTime<Utc>>,
    pub last_replayed_by: Option<OperatorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// First archive of an event.
    pub fn from_draft(draft: DeadLetterDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: DeadLetterId::new(),
            event_id: draft.event_id,
            tenant_id: draft.tenant_id,
            kind: draft.kind,
            payload: draft.payload,
            dedupe_key: draft.dedupe_key,
            mode: draft.mode,
            target_host: draft.target_host,
            attempts: draft.attempts,
            last_error: draft.last_error,
            last_error_code: draft.error_code,
            replay_count: 0,
            last_replayed_at: None,
            last_replayed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-archive after a replayed event failed again. Replay history is kept.
    pub fn absorb(&mut self, draft: DeadLetterDraft, now: DateTime<Utc>) {
        self.payload = draft.payload;
        self.mode = draft.mode;
        self.target_host = draft.target_host;
        self.attempts = draft.attempts;
        self.last_error = draft.last_error;
        self.last_error_code = draft.error_code;
        self.updated_at = now;
    }

    /// Stamp a successful replay.
    pub fn record_replay(&mut self, operator_id: OperatorId, now: DateTime<Utc>) {
        self.replay_count += 1;
        self.last_replayed_at = Some(now);
        self.last_replayed_by = Some(operator_id);
        self.updated_at = now;
    }
}

/// What the dispatcher hands to the sink when a record becomes undeliverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterDraft {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
    pub mode: String,
    pub target_host: Option<String>,
    /// Attempt count including the attempt that failed.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub error_code: String,
}

impl DeadLetterDraft {
    pub fn from_record(
        record: &EventRecord,
        attempts: u32,
        last_error: Option<String>,
        error_code: impl Into<String>,
    ) -> Self {
        Self {
            event_id: record.event_id,
            tenant_id: record.tenant_id,
            kind: record.kind.clone(),
            payload: record.payload.clone(),
            dedupe_key: record.dedupe_key.clone(),
            mode: mode_for_kind(&record.kind),
            target_host: target_host_from_payload(&record.payload),
            attempts,
            last_error,
            error_code: error_code.into(),
        }
    }
}

/// Delivery channel of a kind: the segment before the first `.`.
pub fn mode_for_kind(kind: &str) -> String {
    kind.split('.').next().unwrap_or(kind).to_string()
}

/// Best-effort downstream host from well-known payload fields.
pub fn target_host_from_payload(payload: &serde_json::Value) -> Option<String> {
    if let Some(host) = payload.get("target_host").and_then(|v| v.as_str()) {
        return Some(host.to_string()).filter(|h| !h.is_empty());
    }

    ["url", "webhook_url", "endpoint"]
        .iter()
        .filter_map(|field| payload.get(*field).and_then(|v| v.as_str()))
        .find_map(host_of_url)
}

fn host_of_url(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = match host_port.strip_prefix('[') {
        // IPv6 literal
        Some(v6) => v6.split(']').next()?,
        None => host_port.split(':').next()?,
    };
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}
