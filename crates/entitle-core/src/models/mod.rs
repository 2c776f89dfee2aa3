//! Model registry
//!
//! Which models each vendor offers, resolved per vendor and overlaid with
//! the user's persisted visibility choices.

pub mod registry;
pub mod types;

pub use registry::ModelRegistry;
pub use types::{model_identifier, ModelError, ModelInfo, ModelProvider, Vendor, VendorWhen};
