//! Model registry types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entitlement::ContextFlags;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from resolving a vendor's models.
///
/// Cloneable so one in-flight resolution can hand the same error to every
/// caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// No vendor registered under this id
    #[error("Vendor not registered: {0}")]
    VendorNotRegistered(String),

    /// A vendor with this id is already registered
    #[error("Vendor already registered: {0}")]
    AlreadyRegistered(String),

    /// The vendor is registered but hidden in the current context
    #[error("Vendor not available: {0}")]
    VendorUnavailable(String),

    /// The vendor's provider failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// The vendor was unregistered while resolving
    #[error("Resolution for {0} was abandoned")]
    Abandoned(String),
}

// ============================================================================
// Vendor
// ============================================================================

/// When a vendor shows up in [`ModelRegistry::vendors`](super::ModelRegistry::vendors)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorWhen {
    #[default]
    Always,
    /// The user is signed in
    SignedIn,
    /// The user has signed up for a free or paid plan
    Registered,
    /// The feature is not hidden or disabled
    Visible,
    /// The user belongs to an internal organisation
    Internal,
    /// Every condition holds
    All(Vec<VendorWhen>),
}

impl VendorWhen {
    pub fn evaluate(&self, flags: &ContextFlags) -> bool {
        match self {
            VendorWhen::Always => true,
            VendorWhen::SignedIn => !flags.signed_out,
            VendorWhen::Registered => flags.registered,
            VendorWhen::Visible => !flags.hidden && !flags.disabled,
            VendorWhen::Internal => flags.internal,
            VendorWhen::All(conditions) => conditions.iter().all(|c| c.evaluate(flags)),
        }
    }
}

/// A named provider of models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub when: VendorWhen,
}

impl Vendor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            when: VendorWhen::Always,
        }
    }

    pub fn with_when(mut self, when: VendorWhen) -> Self {
        self.when = when;
        self
    }
}

// ============================================================================
// Model
// ============================================================================

/// One model as reported by its vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub vendor: String,
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    /// Offered in the model picker unless the user overrides it
    #[serde(default)]
    pub is_user_selectable: bool,
}

impl ModelInfo {
    pub fn new(vendor: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vendor: vendor.into(),
            name: name.into(),
            family: None,
            version: None,
            is_default: false,
            is_user_selectable: false,
        }
    }

    pub fn selectable(mut self, selectable: bool) -> Self {
        self.is_user_selectable = selectable;
        self
    }

    pub fn default_model(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    /// Registry-wide identifier, `vendor/id`
    pub fn identifier(&self) -> String {
        model_identifier(&self.vendor, &self.id)
    }
}

pub fn model_identifier(vendor: &str, id: &str) -> String {
    format!("{}/{}", vendor, id)
}

/// Supplies the models of one vendor
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// List models. `allow_prompting` permits activation or sign-in UI.
    async fn provide_models(&self, allow_prompting: bool) -> Result<Vec<ModelInfo>, ModelError>;
}
