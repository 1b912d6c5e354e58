//! Producer-side API.

use std::sync::Arc;

use tracing::{debug, instrument};

use fieldops_core::{Clock, TenantId};

use crate::error::OutboxError;
use crate::record::{EnqueueOutcome, NewEvent};
use crate::store::OutboxStore;

/// Entry point for business code that needs a side effect delivered.
///
/// Enqueue is idempotent per `(tenant_id, dedupe_key)`: repeating a call (a
/// retried request, a double-submitted form) returns the record created by
/// the first one and never schedules a second delivery.
pub struct Outbox<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: OutboxStore> Outbox<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self, payload), fields(tenant_id = %tenant_id, kind = %kind), err)]
    pub async fn enqueue(
        &self,
        tenant_id: TenantId,
        kind: &str,
        payload: serde_json::Value,
        dedupe_key: &str,
    ) -> Result<EnqueueOutcome, OutboxError> {
        let event = NewEvent::new(tenant_id, kind, payload, dedupe_key)?;
        let outcome = self.store.enqueue(event, self.clock.now()).await?;

        if !outcome.inserted {
            debug!(
                event_id = %outcome.record.event_id,
                dedupe_key,
                "duplicate enqueue absorbed"
            );
        }

        Ok(outcome)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
