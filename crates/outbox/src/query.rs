//! Read-side query types for operator triage.
//!
//! All queries are tenant-scoped and paginated by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dead_letter::DeadLetterRecord;

/// Default page size.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
/// Hard cap on page size.
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Pagination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of records to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for dead-letter listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    /// Only entries archived at or after this time.
    pub created_after: Option<DateTime<Utc>>,
    /// Only entries archived at or before this time.
    pub created_before: Option<DateTime<Utc>>,
    /// Only entries with this `last_error_code`.
    pub error_code: Option<String>,
    /// Only entries of this kind.
    pub kind: Option<String>,
}

impl DeadLetterFilter {
    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        self.created_after.is_none_or(|t| record.created_at >= t)
            && self.created_before.is_none_or(|t| record.created_at <= t)
            && self
                .error_code
                .as_deref()
                .is_none_or(|code| record.last_error_code == code)
            && self.kind.as_deref().is_none_or(|kind| record.kind == kind)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of matching records (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        let has_more = total > u64::from(pagination.offset) + items.len() as u64;
        Self {
            items,
            total,
            pagination,
            has_more,
        }
    }
}

/// Per-tenant backlog counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogStats {
    pub pending: u64,
    /// Pending records whose `next_attempt_at` has passed.
    pub due: u64,
    pub sent: u64,
    pub dead: u64,
}
