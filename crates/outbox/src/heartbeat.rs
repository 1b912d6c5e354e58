//! Runner heartbeats.
//!
//! Each runner upserts one row per cycle. Monitoring reads it to tell apart a
//! stopped loop, an idle loop and a loop that keeps erroring.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use fieldops_core::Clock;

use crate::error::OutboxError;
use crate::store::HeartbeatStore;

/// Liveness row of one logical runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerHeartbeat {
    pub runner_name: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// `hostname:pid` of the process that wrote the row last.
    pub runner_instance_id: String,
}

/// How a batch cycle ended, from the runner's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cycle ran to completion (it may have delivered nothing).
    Success,
    /// The cycle hit an internal error (store unreachable, ...).
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatUpdate {
    pub runner_name: String,
    pub runner_instance_id: String,
    pub at: DateTime<Utc>,
    pub outcome: CycleOutcome,
}

impl RunnerHeartbeat {
    /// Fold a cycle report into the previous row (or start a new one).
    pub fn apply(previous: Option<RunnerHeartbeat>, update: &HeartbeatUpdate) -> RunnerHeartbeat {
        let mut beat = previous.unwrap_or_else(|| RunnerHeartbeat {
            runner_name: update.runner_name.clone(),
            last_heartbeat_at: update.at,
            last_success_at: None,
            last_error: None,
            last_error_at: None,
            consecutive_failures: 0,
            runner_instance_id: update.runner_instance_id.clone(),
        });

        beat.last_heartbeat_at = update.at;
        beat.runner_instance_id = update.runner_instance_id.clone();

        match &update.outcome {
            CycleOutcome::Success => {
                beat.last_success_at = Some(update.at);
                beat.consecutive_failures = 0;
            }
            CycleOutcome::Failure(error) => {
                beat.consecutive_failures = beat.consecutive_failures.saturating_add(1);
                beat.last_error = Some(error.clone());
                beat.last_error_at = Some(update.at);
            }
        }

        beat
    }
}

/// Derived status for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Heartbeat is fresh and the last cycle succeeded.
    Healthy,
    /// Heartbeat is fresh but cycles keep failing.
    Failing,
    /// No heartbeat within the staleness window: the loop is not running.
    Stalled,
}

/// Heartbeat snapshot plus its interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerHealth {
    pub heartbeat: RunnerHeartbeat,
    pub status: RunnerStatus,
}

impl RunnerHealth {
    pub fn classify(heartbeat: RunnerHeartbeat, now: DateTime<Utc>, stale_after: Duration) -> Self {
        let status = if now - heartbeat.last_heartbeat_at > stale_after {
            RunnerStatus::Stalled
        } else if heartbeat.consecutive_failures > 0 {
            RunnerStatus::Failing
        } else {
            RunnerStatus::Healthy
        };
        Self { heartbeat, status }
    }
}

/// Writes a runner's heartbeat after each cycle.
pub struct HeartbeatReporter<H> {
    store: H,
    runner_name: String,
    instance_id: String,
    clock: Arc<dyn Clock>,
}

impl<H: HeartbeatStore> HeartbeatReporter<H> {
    pub fn new(
        store: H,
        runner_name: impl Into<String>,
        instance_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            runner_name: runner_name.into(),
            instance_id: instance_id.into(),
            clock,
        }
    }

    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    /// Record the outcome of one cycle.
    ///
    /// Failures to write are logged and returned; callers must not treat them
    /// as fatal, the next cycle writes again.
    pub async fn report(&self, outcome: CycleOutcome) -> Result<RunnerHeartbeat, OutboxError> {
        let update = HeartbeatUpdate {
            runner_name: self.runner_name.clone(),
            runner_instance_id: self.instance_id.clone(),
            at: self.clock.now(),
            outcome,
        };

        self.store.record_cycle(&update).await.inspect_err(|e| {
            warn!(runner = %self.runner_name, error = %e, "failed to record heartbeat");
        })
    }

    /// Current health for `runner_name` (any runner, not only this one).
    pub async fn health(
        &self,
        runner_name: &str,
        stale_after: Duration,
    ) -> Result<Option<RunnerHealth>, OutboxError> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_heartbeat(runner_name)
            .await?
            .map(|beat| RunnerHealth::classify(beat, now, stale_after)))
    }
}

/// `hostname:pid` of the current process.
pub fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}
