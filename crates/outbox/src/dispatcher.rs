//! Delivery dispatcher.
//!
//! Turns one claimed record into exactly one state transition:
//!
//! ```text
//!            ┌── lease expired ────────────► untouched (handler not invoked)
//!            ├── circuit open ─────────────► pending (deferred, attempts unchanged)
//! claimed ───┼── handler ok ───────────────► sent
//!            ├── transient, under ceiling ─► pending (backoff)
//!            └── permanent / at ceiling ───► dead (+ dead letter)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use fieldops_core::Clock;

use crate::circuit::CircuitGate;
use crate::dead_letter::{DeadLetterDraft, codes};
use crate::error::OutboxError;
use crate::handler::{DeliveryContext, HandlerError, HandlerRegistry};
use crate::record::ClaimedEvent;
use crate::retry::RetryPolicy;
use crate::store::{OutboxStore, Reschedule};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on one handler invocation.
    pub handler_timeout: Duration,
    /// Delay applied while a kind's circuit is open.
    pub circuit_retry_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(10),
            circuit_retry_delay: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_circuit_retry_delay(mut self, delay: Duration) -> Self {
        self.circuit_retry_delay = delay;
        self
    }
}

/// What happened to one claimed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { attempts: u32 },
    Rescheduled {
        attempts: u32,
        next_attempt_at: chrono::DateTime<chrono::Utc>,
    },
    DeadLettered { attempts: u32, error_code: String },
    /// Circuit open; no attempt was made.
    Deferred {
        next_attempt_at: chrono::DateTime<chrono::Utc>,
    },
    /// Another runner re-claimed the record before this one reported back.
    LeaseLost,
}

pub struct Dispatcher<S> {
    store: S,
    handlers: HandlerRegistry,
    circuit: Arc<dyn CircuitGate>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl<S: OutboxStore> Dispatcher<S> {
    pub fn new(
        store: S,
        handlers: HandlerRegistry,
        circuit: Arc<dyn CircuitGate>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            circuit,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Deliver one claimed record and persist the resulting transition.
    ///
    /// Handler failures are part of the outcome; only storage problems are errors.
    #[instrument(
        skip(self, claim),
        fields(
            tenant_id = %claim.tenant_id(),
            event_id = %claim.event_id(),
            kind = %claim.record.kind,
        )
    )]
    pub async fn dispatch(&self, claim: &ClaimedEvent) -> Result<DispatchOutcome, OutboxError> {
        match self.dispatch_inner(claim).await {
            Err(OutboxError::LeaseLost(event_id)) => {
                warn!(%event_id, "lease no longer held; record left to its owner");
                Ok(DispatchOutcome::LeaseLost)
            }
            other => other,
        }
    }

    async fn dispatch_inner(&self, claim: &ClaimedEvent) -> Result<DispatchOutcome, OutboxError> {
        let record = &claim.record;

        // A lapsed lease may already belong to another runner.
        if self.clock.now() >= claim.leased_until {
            return Err(OutboxError::LeaseLost(record.event_id));
        }

        if self.circuit.is_open(&record.kind) {
            let next_attempt_at = after(self.clock.now(), self.config.circuit_retry_delay);
            let update = Reschedule {
                next_attempt_at,
                attempts: record.attempts,
                last_error: record.last_error.clone(),
            };
            self.store.reschedule(claim, update, self.clock.now()).await?;
            debug!(%next_attempt_at, "circuit open, delivery deferred");
            return Ok(DispatchOutcome::Deferred { next_attempt_at });
        }

        let attempts = record.attempts.saturating_add(1);

        let Some(handler) = self.handlers.resolve(&record.kind) else {
            let message = format!("no handler registered for kind {}", record.kind);
            return self
                .dead_letter(claim, attempts, message, codes::UNKNOWN_KIND)
                .await;
        };

        let ctx = DeliveryContext {
            tenant_id: record.tenant_id,
            event_id: record.event_id,
            kind: record.kind.clone(),
            attempt: attempts,
            dedupe_key: record.dedupe_key.clone(),
        };

        let result = match tokio::time::timeout(
            self.config.handler_timeout,
            handler.deliver(&ctx, &record.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Transient {
                code: codes::TIMEOUT.to_string(),
                message: format!(
                    "handler timed out after {}ms",
                    self.config.handler_timeout.as_millis()
                ),
            }),
        };

        let now = self.clock.now();
        match result {
            Ok(()) => {
                self.store.mark_sent(claim, attempts, now).await?;
                info!(attempts, "event delivered");
                Ok(DispatchOutcome::Sent { attempts })
            }
            Err(HandlerError::Permanent { code, message }) => {
                self.dead_letter(claim, attempts, message, &code).await
            }
            Err(HandlerError::Transient { code, message }) => {
                if !self.config.retry.should_retry(attempts) {
                    let message = format!("{code}: {message}");
                    return self
                        .dead_letter(claim, attempts, message, codes::MAX_ATTEMPTS_EXCEEDED)
                        .await;
                }

                let seed = retry_seed(claim);
                let next_attempt_at = self.config.retry.next_attempt_at(now, attempts, seed);
                let update = Reschedule {
                    next_attempt_at,
                    attempts,
                    last_error: Some(format!("{code}: {message}")),
                };
                self.store.reschedule(claim, update, now).await?;
                warn!(
                    attempts,
                    %next_attempt_at,
                    error_code = %code,
                    "delivery failed, retry scheduled"
                );
                Ok(DispatchOutcome::Rescheduled {
                    attempts,
                    next_attempt_at,
                })
            }
        }
    }

    async fn dead_letter(
        &self,
        claim: &ClaimedEvent,
        attempts: u32,
        message: String,
        code: &str,
    ) -> Result<DispatchOutcome, OutboxError> {
        let draft = DeadLetterDraft::from_record(&claim.record, attempts, Some(message), code);
        let dead = self.store.mark_dead(claim, draft, self.clock.now()).await?;
        warn!(
            attempts,
            error_code = code,
            dead_letter_id = %dead.id,
            "event dead-lettered"
        );
        Ok(DispatchOutcome::DeadLettered {
            attempts,
            error_code: code.to_string(),
        })
    }
}

fn after(now: chrono::DateTime<chrono::Utc>, delay: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

/// Per-record jitter seed so records that failed together spread out.
fn retry_seed(claim: &ClaimedEvent) -> u64 {
    claim.event_id().as_uuid().as_u64_pair().1
}
