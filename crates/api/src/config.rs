//! Process configuration, read once from the environment at startup.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | unset: in-memory stores (dev mode) |
//! | `DATABASE_MAX_CONNECTIONS` | `10` |
//! | `BIND_ADDR` | `0.0.0.0:8080` |
//! | `OUTBOX_RUNNER_NAME` | `outbox-delivery` |
//! | `OUTBOX_POLL_INTERVAL_MS` | `1000` |
//! | `OUTBOX_BATCH_SIZE` | `100` |
//! | `OUTBOX_PER_TENANT_LIMIT` | `25` (`0` disables the cap) |
//! | `OUTBOX_MAX_CONCURRENT` | `8` |
//! | `OUTBOX_HANDLER_TIMEOUT_MS` | `10000` |
//! | `OUTBOX_LEASE_SECS` | `60` |
//! | `OUTBOX_MAX_ATTEMPTS` | `8` |
//! | `OUTBOX_BASE_DELAY_MS` | `30000` |
//! | `OUTBOX_MAX_DELAY_MS` | `3600000` |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use fieldops_outbox::{DispatcherConfig, RetryPolicy, RunnerConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Postgres connection string; `None` selects the in-memory stores.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub runner: RunnerSettings,
}

/// Tuning of the delivery loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub name: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub per_tenant_limit: Option<usize>,
    pub max_concurrent: usize,
    pub handler_timeout: Duration,
    pub lease_duration: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            name: "outbox-delivery".to_string(),
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            per_tenant_limit: Some(25),
            max_concurrent: 8,
            handler_timeout: Duration::from_millis(10_000),
            lease_duration: Duration::from_secs(60),
            max_attempts: 8,
            base_delay: Duration::from_millis(30_000),
            max_delay: Duration::from_millis(3_600_000),
        }
    }
}

impl RunnerSettings {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_name(self.name.clone())
            .with_poll_interval(self.poll_interval)
            .with_batch_size(self.batch_size)
            .with_per_tenant_limit(self.per_tenant_limit)
            .with_max_concurrent(self.max_concurrent)
            .with_lease_duration(self.lease_duration)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_handler_timeout(self.handler_timeout)
            .with_retry(RetryPolicy::exponential(
                self.max_attempts,
                self.base_delay,
                self.max_delay,
            ))
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = RunnerSettings::default();

        let per_tenant_limit: usize = parse_or(&lookup, "OUTBOX_PER_TENANT_LIMIT", 25)?;
        let runner = RunnerSettings {
            name: lookup("OUTBOX_RUNNER_NAME")
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.name),
            poll_interval: Duration::from_millis(positive(
                &lookup,
                "OUTBOX_POLL_INTERVAL_MS",
                1000,
            )?),
            batch_size: positive(&lookup, "OUTBOX_BATCH_SIZE", 100)?,
            per_tenant_limit: (per_tenant_limit > 0).then_some(per_tenant_limit),
            max_concurrent: positive(&lookup, "OUTBOX_MAX_CONCURRENT", 8)?,
            handler_timeout: Duration::from_millis(positive(
                &lookup,
                "OUTBOX_HANDLER_TIMEOUT_MS",
                10_000,
            )?),
            lease_duration: Duration::from_secs(positive(&lookup, "OUTBOX_LEASE_SECS", 60)?),
            max_attempts: positive(&lookup, "OUTBOX_MAX_ATTEMPTS", 8)?,
            base_delay: Duration::from_millis(parse_or(&lookup, "OUTBOX_BASE_DELAY_MS", 30_000)?),
            max_delay: Duration::from_millis(parse_or(
                &lookup,
                "OUTBOX_MAX_DELAY_MS",
                3_600_000,
            )?),
        };

        if runner.max_delay < runner.base_delay {
            return Err(ConfigError::Invalid {
                var: "OUTBOX_MAX_DELAY_MS",
                value: runner.max_delay.as_millis().to_string(),
                reason: "must not be smaller than OUTBOX_BASE_DELAY_MS".to_string(),
            });
        }

        // Leave a handler timeout of slack for claiming and persisting the outcome.
        if runner.lease_duration < runner.handler_timeout.saturating_mul(2) {
            return Err(ConfigError::Invalid {
                var: "OUTBOX_LEASE_SECS",
                value: runner.lease_duration.as_secs().to_string(),
                reason: "must be at least twice OUTBOX_HANDLER_TIMEOUT_MS".to_string(),
            });
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: positive(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            bind_addr: parse_or(
                &lookup,
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            runner,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let value = parse_or(lookup, var, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
