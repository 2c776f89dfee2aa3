//! # entitle-core
//!
//! Entitlement, quota and model availability resolution for the chat
//! feature - shared between the CLI and embedding hosts.
//!
//! This crate provides:
//! - Entitlement resolution and published context flags (`entitlement` module)
//! - Quota accounting (`quota` module)
//! - Per-vendor model registry (`models` module)
//! - Configuration loading (`config` module)
//! - Zero-argument change events (`events` module)
//! - Unified error handling (`error` module)

pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod models;
pub mod quota;

// Re-exports for convenience
pub use config::{load_config, load_config_from, EntitlementConfig};
pub use error::{Error, Result};
pub use events::{Emitter, Subscription};

pub use entitlement::{
    ChatEntitlementService, ContextFlags, ContextPublisher, Entitlement, EntitlementState,
    EntitlementTier, EntitlementUpdate, FileStateStore, MemoryStateStore, Readiness,
    ResolveOutcome, Session, SignInOptions, SignUpOutcome, StateStore,
};
pub use models::{ModelError, ModelInfo, ModelProvider, ModelRegistry, Vendor, VendorWhen};
pub use quota::{QuotaAccountant, QuotaFlags, QuotaKind, QuotaSnapshot, Quotas};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = version().split('.').collect();
        assert_eq!(parts.len(), 3, "Version should be in x.y.z format");
    }
}
