//! `fieldops-core`: shared primitives for the delivery workspace.
//!
//! Pure types only: identifiers, the domain error model and the clock seam.
//! No storage or runtime concerns live here.

pub mod error;
pub mod id;
pub mod time;

pub use error::{DomainError, DomainResult};
pub use id::{DeadLetterId, EventId, OperatorId, TenantId};
pub use time::{Clock, ManualClock, SystemClock};
