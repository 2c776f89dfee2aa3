//! Quota tracking
//!
//! Snapshot types for the metered chat resources and the accountant that
//! detects exhausted/remaining transitions between accepted sets.

pub mod accountant;
pub mod types;

pub use accountant::{compare, QuotaAccountant, QuotaChange, QuotaFlags};
pub use types::{QuotaKind, QuotaSnapshot, Quotas};
