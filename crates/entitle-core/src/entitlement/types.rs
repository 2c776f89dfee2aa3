//! Entitlement data model
//!
//! Tier, sentiment flags and the persisted state record, plus the partial
//! update type accepted by the context publisher and the derived flags it
//! publishes.

use serde::{Deserialize, Serialize};

// ============================================================================
// Tier
// ============================================================================

/// Plan/status level of the current user, ordered by privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementTier {
    /// Signed out
    #[default]
    Unknown,
    /// Signed in, not yet resolved
    Unresolved,
    /// Signed in and eligible to sign up for the free plan
    Available,
    /// Signed in but not eligible for the free plan
    Unavailable,
    Free,
    Pro,
    ProPlus,
    Business,
    Enterprise,
}

impl EntitlementTier {
    pub const ALL: [EntitlementTier; 9] = [
        EntitlementTier::Unknown,
        EntitlementTier::Unresolved,
        EntitlementTier::Available,
        EntitlementTier::Unavailable,
        EntitlementTier::Free,
        EntitlementTier::Pro,
        EntitlementTier::ProPlus,
        EntitlementTier::Business,
        EntitlementTier::Enterprise,
    ];

    /// Paid plans
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            EntitlementTier::Pro
                | EntitlementTier::ProPlus
                | EntitlementTier::Business
                | EntitlementTier::Enterprise
        )
    }

    /// Tiers that mean the user has signed up for some plan
    pub fn is_registered(&self) -> bool {
        *self == EntitlementTier::Free || self.is_paid()
    }

    /// Name of the published plan flag for this tier
    pub fn flag_name(&self) -> &'static str {
        match self {
            EntitlementTier::Unknown => "planUnknown",
            EntitlementTier::Unresolved => "planUnresolved",
            EntitlementTier::Available => "planAvailable",
            EntitlementTier::Unavailable => "planUnavailable",
            EntitlementTier::Free => "planFree",
            EntitlementTier::Pro => "planPro",
            EntitlementTier::ProPlus => "planProPlus",
            EntitlementTier::Business => "planBusiness",
            EntitlementTier::Enterprise => "planEnterprise",
        }
    }
}

impl std::fmt::Display for EntitlementTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntitlementTier::Unknown => "unknown",
            EntitlementTier::Unresolved => "unresolved",
            EntitlementTier::Available => "available",
            EntitlementTier::Unavailable => "unavailable",
            EntitlementTier::Free => "free",
            EntitlementTier::Pro => "pro",
            EntitlementTier::ProPlus => "pro_plus",
            EntitlementTier::Business => "business",
            EntitlementTier::Enterprise => "enterprise",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for EntitlementTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntitlementTier::ALL
            .iter()
            .copied()
            .find(|tier| tier.to_string() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown entitlement tier: {}", s))
    }
}

// ============================================================================
// State
// ============================================================================

/// UI-relevant flags orthogonal to the tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentiment {
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub untrusted: bool,
    #[serde(default)]
    pub installed: bool,
    /// Session-only, never persisted
    #[serde(skip)]
    pub later: bool,
    #[serde(default)]
    pub registered: bool,
}

/// The persisted and observable entitlement record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementState {
    #[serde(default)]
    pub tier: EntitlementTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organisations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(flatten)]
    pub sentiment: Sentiment,
}

impl EntitlementState {
    /// A signed-out state with no sentiment set
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Copy of this state without the session-only fields
    pub fn persisted(&self) -> Self {
        let mut state = self.clone();
        state.sentiment.later = false;
        state
    }
}

/// A resolved entitlement: tier plus the fields that travel with it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub tier: EntitlementTier,
    #[serde(default)]
    pub organisations: Option<Vec<String>>,
    #[serde(default)]
    pub sku: Option<String>,
}

impl Entitlement {
    pub fn new(tier: EntitlementTier) -> Self {
        Self {
            tier,
            organisations: None,
            sku: None,
        }
    }

    pub fn with_organisations(mut self, organisations: Option<Vec<String>>) -> Self {
        self.organisations = organisations;
        self
    }

    pub fn with_sku(mut self, sku: Option<String>) -> Self {
        self.sku = sku;
        self
    }
}

/// Partial update applied by [`ContextPublisher::update`](super::context::ContextPublisher::update)
///
/// Only fields that are `Some` are applied. A supplied entitlement replaces
/// tier, organisations and sku together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitlementUpdate {
    pub entitlement: Option<Entitlement>,
    pub installed: Option<bool>,
    pub disabled: Option<bool>,
    pub untrusted: Option<bool>,
    pub hidden: Option<bool>,
    pub later: Option<bool>,
}

impl EntitlementUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(tier: EntitlementTier) -> Self {
        Self::entitlement(Entitlement::new(tier))
    }

    pub fn entitlement(entitlement: Entitlement) -> Self {
        Self {
            entitlement: Some(entitlement),
            ..Self::default()
        }
    }

    /// Extension install state as reported by the host
    pub fn extension(installed: bool, disabled: bool, untrusted: bool) -> Self {
        Self {
            installed: Some(installed),
            disabled: Some(disabled),
            untrusted: Some(untrusted),
            ..Self::default()
        }
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = Some(hidden);
        self
    }

    pub fn with_later(mut self, later: bool) -> Self {
        self.later = Some(later);
        self
    }
}

// ============================================================================
// Published flags
// ============================================================================

/// Value held by a published context slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Text(Option<String>),
    List(Option<Vec<String>>),
}

impl std::fmt::Display for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextValue::Bool(b) => write!(f, "{}", b),
            ContextValue::Text(Some(s)) => write!(f, "{}", s),
            ContextValue::List(Some(items)) => write!(f, "{}", items.join(",")),
            ContextValue::Text(None) | ContextValue::List(None) => write!(f, "-"),
        }
    }
}

/// Flags derived from [`EntitlementState`] and published to observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFlags {
    pub tier: EntitlementTier,
    pub signed_out: bool,
    pub can_sign_up: bool,
    pub hidden: bool,
    pub disabled: bool,
    pub untrusted: bool,
    pub installed: bool,
    pub later: bool,
    pub registered: bool,
    pub organisations: Option<Vec<String>>,
    pub internal: bool,
    pub sku: Option<String>,
    pub anonymous: bool,
}

impl ContextFlags {
    /// Plan flag for `tier`; exactly one tier reports true
    pub fn plan(&self, tier: EntitlementTier) -> bool {
        self.tier == tier
    }

    /// Sentiment as seen by observers
    pub fn sentiment(&self) -> Sentiment {
        Sentiment {
            hidden: self.hidden,
            disabled: self.disabled,
            untrusted: self.untrusted,
            installed: self.installed,
            later: self.later,
            registered: self.registered,
        }
    }

    /// Every published slot by name, in a stable order
    pub fn slots(&self) -> Vec<(&'static str, ContextValue)> {
        let mut slots: Vec<(&'static str, ContextValue)> = EntitlementTier::ALL
            .iter()
            .map(|tier| (tier.flag_name(), ContextValue::Bool(self.plan(*tier))))
            .collect();
        slots.extend([
            ("signedOut", ContextValue::Bool(self.signed_out)),
            ("canSignUp", ContextValue::Bool(self.can_sign_up)),
            ("hidden", ContextValue::Bool(self.hidden)),
            ("disabled", ContextValue::Bool(self.disabled)),
            ("untrusted", ContextValue::Bool(self.untrusted)),
            ("installed", ContextValue::Bool(self.installed)),
            ("later", ContextValue::Bool(self.later)),
            ("registered", ContextValue::Bool(self.registered)),
            ("organisations", ContextValue::List(self.organisations.clone())),
            ("internal", ContextValue::Bool(self.internal)),
            ("sku", ContextValue::Text(self.sku.clone())),
            ("anonymous", ContextValue::Bool(self.anonymous)),
        ]);
        slots
    }

    /// Whether the tier-related slots differ
    pub(crate) fn entitlement_differs(&self, other: &ContextFlags) -> bool {
        self.tier != other.tier
            || self.organisations != other.organisations
            || self.internal != other.internal
            || self.sku != other.sku
    }

    /// Whether the sentiment slots differ
    pub(crate) fn sentiment_differs(&self, other: &ContextFlags) -> bool {
        self.sentiment() != other.sentiment()
    }
}

/// `anonymous` is only reachable for signed-out users with the feature visible
pub fn is_anonymous(allow_anonymous: bool, tier: EntitlementTier, sentiment: &Sentiment) -> bool {
    allow_anonymous && tier == EntitlementTier::Unknown && !(sentiment.hidden || sentiment.disabled)
}
