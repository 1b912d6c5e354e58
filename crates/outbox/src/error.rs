//! Outbox storage errors.

use thiserror::Error;

use fieldops_core::{DomainError, EventId};

/// Outbox persistence error.
///
/// These are infrastructure errors (storage, leases, isolation). Delivery
/// failures reported by handlers are `HandlerError`s and never surface here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboxError {
    /// Input rejected before touching storage.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// The claim's lease was superseded; the caller must not apply its result.
    #[error("lease lost for event {0}")]
    LeaseLost(EventId),

    /// Cross-tenant access attempted.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Backend failure (connection, query, poisoned lock, ...).
    #[error("storage error: {0}")]
    Storage(String),
}

impl OutboxError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<DomainError> for OutboxError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::NotFound => Self::NotFound("not found".to_string()),
            DomainError::Conflict(msg) => Self::Storage(format!("conflict: {msg}")),
        }
    }
}
