use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use fieldops_core::DeadLetterId;
use fieldops_outbox::{DeadLetterFilter, Pagination};

use crate::app::errors;

// -------------------------
// Query DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterListQuery {
    pub error_code: Option<String>,
    pub kind: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl DeadLetterListQuery {
    pub fn filter(&self) -> DeadLetterFilter {
        DeadLetterFilter {
            created_after: self.created_after,
            created_before: self.created_before,
            error_code: non_blank(&self.error_code),
            kind: non_blank(&self.kind),
        }
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunnerHealthQuery {
    /// Seconds without a heartbeat after which the runner counts as stalled.
    pub stale_after: Option<u32>,
}

/// Default staleness window for runner health.
pub const DEFAULT_STALE_AFTER_SECS: u32 = 300;

impl RunnerHealthQuery {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(
            self.stale_after.unwrap_or(DEFAULT_STALE_AFTER_SECS),
        ))
    }
}

// -------------------------
// Path parsing
// -------------------------

pub fn parse_dead_letter_id(raw: &str) -> Result<DeadLetterId, axum::response::Response> {
    raw.parse().map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            "dead letter id must be a UUID",
        )
    })
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
