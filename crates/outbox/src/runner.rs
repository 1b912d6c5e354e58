//! Batch runner: claim → dispatch → heartbeat, on a timer.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use fieldops_core::Clock;

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::OutboxError;
use crate::heartbeat::{CycleOutcome, HeartbeatReporter};
use crate::store::{ClaimRequest, HeartbeatStore, OutboxStore};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Logical runner name; heartbeats are keyed by it.
    pub name: String,
    /// Pause between batches.
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Cap on one tenant's share of a batch.
    pub per_tenant_limit: Option<usize>,
    /// Handler invocations in flight at once.
    pub max_concurrent: usize,
    pub lease_duration: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "outbox-delivery".to_string(),
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            per_tenant_limit: Some(25),
            max_concurrent: 8,
            lease_duration: Duration::from_secs(60),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_per_tenant_limit(mut self, limit: Option<usize>) -> Self {
        self.per_tenant_limit = limit;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Largest batch that drains within one lease when every handler call
    /// runs for the full `handler_timeout`.
    pub fn effective_batch_size(&self, handler_timeout: Duration) -> usize {
        let timeout_ms = handler_timeout.as_millis();
        if timeout_ms == 0 {
            return self.batch_size;
        }
        // Rounds of `max_concurrent` calls that finish strictly inside the lease.
        let rounds = (self.lease_duration.as_millis().saturating_sub(1) / timeout_ms).max(1);
        let drainable = usize::try_from(rounds)
            .unwrap_or(usize::MAX)
            .saturating_mul(self.max_concurrent.max(1));
        self.batch_size.min(drainable)
    }

    fn claim_request(&self, handler_timeout: Duration) -> ClaimRequest {
        ClaimRequest {
            limit: self.effective_batch_size(handler_timeout),
            per_tenant_limit: self.per_tenant_limit,
            tenant_id: None,
            lease_duration: self.lease_duration,
        }
    }
}

/// Tally of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub lease_lost: usize,
    /// Records whose outcome could not be persisted.
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent { .. } => self.sent += 1,
            DispatchOutcome::Rescheduled { .. } => self.rescheduled += 1,
            DispatchOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            DispatchOutcome::Deferred { .. } => self.deferred += 1,
            DispatchOutcome::LeaseLost => self.lease_lost += 1,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("claim failed: {0}")]
    Claim(#[source] OutboxError),
}

/// Periodic delivery loop over one store.
pub struct OutboxRunner<S, H> {
    dispatcher: Dispatcher<S>,
    heartbeat: HeartbeatReporter<H>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
}

impl<S, H> OutboxRunner<S, H>
where
    S: OutboxStore + 'static,
    H: HeartbeatStore + 'static,
{
    pub fn new(
        dispatcher: Dispatcher<S>,
        heartbeat: HeartbeatReporter<H>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            dispatcher,
            heartbeat,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one batch and write the heartbeat.
    ///
    /// A failing record never aborts the batch. Store failures while persisting
    /// individual outcomes count toward the report's `errors` and mark the cycle
    /// as failed in the heartbeat; a failed claim is returned as an error.
    #[instrument(skip(self), fields(runner = %self.config.name))]
    pub async fn run_once(&self) -> Result<BatchReport, RunnerError> {
        let result = self.run_batch().await;

        let outcome = match &result {
            Ok(report) if report.errors == 0 => CycleOutcome::Success,
            Ok(report) => CycleOutcome::Failure(format!(
                "{} of {} records could not be updated",
                report.errors, report.claimed
            )),
            Err(e) => CycleOutcome::Failure(e.to_string()),
        };
        // Logged by the reporter; the next cycle writes again.
        let _ = self.heartbeat.report(outcome).await;

        result
    }

    async fn run_batch(&self) -> Result<BatchReport, RunnerError> {
        let request = self
            .config
            .claim_request(self.dispatcher.config().handler_timeout);
        let claims = self
            .dispatcher
            .store()
            .claim_batch(&request, self.clock.now())
            .await
            .map_err(RunnerError::Claim)?;

        let mut report = BatchReport {
            claimed: claims.len(),
            ..BatchReport::default()
        };
        if claims.is_empty() {
            return Ok(report);
        }

        let results: Vec<_> = stream::iter(claims)
            .map(|claim| async move {
                let result = self.dispatcher.dispatch(&claim).await;
                (claim.event_id(), result)
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        for (event_id, result) in results {
            match result {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    report.errors += 1;
                    error!(%event_id, error = %e, "failed to persist delivery outcome");
                }
            }
        }

        info!(
            claimed = report.claimed,
            sent = report.sent,
            rescheduled = report.rescheduled,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            "batch complete"
        );
        Ok(report)
    }

    /// Start the loop on the current tokio runtime.
    pub fn spawn(self: Arc<Self>) -> RunnerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = self.config.name.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(runner = %name, "outbox runner started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }

                if let Err(e) = self.run_once().await {
                    warn!(runner = %name, error = %e, "batch failed");
                }

                if *shutdown_rx.borrow() {
                    break;
                }
            }

            debug!(runner = %name, "outbox runner stopped");
        });

        RunnerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

/// Handle to stop a spawned runner.
///
/// Shutdown is observed between batches; an in-flight batch completes first.
#[derive(Debug)]
pub struct RunnerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}
