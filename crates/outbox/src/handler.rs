//! Delivery handlers and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use fieldops_core::{EventId, TenantId};

use crate::dead_letter::codes;

/// What a handler knows about the attempt it is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub tenant_id: TenantId,
    pub event_id: EventId,
    pub kind: String,
    /// 1-based number of this attempt.
    pub attempt: u32,
    /// Forward this to downstream APIs that accept idempotency keys.
    pub dedupe_key: String,
}

/// Failure reported by a handler.
///
/// The split drives the retry decision: transient failures are retried with
/// backoff until the ceiling, permanent ones go straight to the dead-letter sink.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Network error, 5xx, rate limit, timeout.
    #[error("transient failure ({code}): {message}")]
    Transient { code: String, message: String },

    /// Validation, 4xx, missing recipient.
    #[error("permanent failure ({code}): {message}")]
    Permanent { code: String, message: String },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            code: codes::TRANSIENT_FAILURE.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            code: codes::PERMANENT_FAILURE.to_string(),
            message: message.into(),
        }
    }

    /// Override the machine-readable code (e.g. `smtp_451`, `http_404`).
    pub fn with_code(self, code: impl Into<String>) -> Self {
        match self {
            Self::Transient { message, .. } => Self::Transient {
                code: code.into(),
                message,
            },
            Self::Permanent { message, .. } => Self::Permanent {
                code: code.into(),
                message,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Transient { code, .. } | Self::Permanent { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::Permanent { message, .. } => message,
        }
    }
}

/// Performs the side effect of one event kind.
///
/// Handlers must tolerate being called more than once for the same event: a
/// lease can expire while a slow call is still in flight.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(
        &self,
        ctx: &DeliveryContext,
        payload: &serde_json::Value,
    ) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> DeliveryHandler for FnHandler<F>
where
    F: Fn(&DeliveryContext, &serde_json::Value) -> Result<(), HandlerError> + Send + Sync,
{
    async fn deliver(
        &self,
        ctx: &DeliveryContext,
        payload: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        (self.0)(ctx, payload)
    }
}

/// Kind → handler table.
///
/// Lookup order: exact kind, then the longest matching `prefix.*` pattern,
/// then `*`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DeliveryHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> &mut Self {
        self.handlers.insert(pattern.into(), handler);
        self
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&DeliveryContext, &serde_json::Value) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(pattern, Arc::new(FnHandler(handler)))
    }

    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn DeliveryHandler>> {
        if let Some(handler) = self.handlers.get(kind) {
            return Some(handler.clone());
        }

        self.handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = kind.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone())
            .or_else(|| self.handlers.get("*").cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}
