//! Entitlement endpoint payloads
//!
//! Wire types for the entitlement, sign-up and usage endpoints, and the
//! ordered rule table that maps a parsed entitlement payload to a tier.

use std::collections::HashMap;

use serde::Deserialize;

use super::types::{Entitlement, EntitlementTier};
use crate::quota::{QuotaSnapshot, Quotas};

/// SKU the server reports for users on the limited free plan
pub const LIMITED_FREE_SKU: &str = "free_limited_copilot";

// ============================================================================
// Entitlement endpoint
// ============================================================================

/// Body of a successful entitlement GET
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntitlementResponse {
    #[serde(default)]
    pub access_type_sku: Option<String>,
    #[serde(default)]
    pub can_signup_for_limited: Option<bool>,
    #[serde(default, rename = "copilot_plan")]
    pub plan: Option<String>,
    #[serde(default)]
    pub chat_enabled: Option<bool>,
    #[serde(default)]
    pub organization_login_list: Option<Vec<String>>,
    #[serde(default)]
    pub analytics_tracking_id: Option<String>,
    #[serde(default)]
    pub quota_snapshots: Option<HashMap<String, RawQuotaSnapshot>>,
    #[serde(default)]
    pub monthly_quotas: Option<LegacyQuotas>,
    #[serde(default)]
    pub limited_user_quotas: Option<LegacyQuotas>,
    #[serde(default)]
    pub quota_reset_date_utc: Option<String>,
    #[serde(default)]
    pub quota_reset_date: Option<String>,
    #[serde(default)]
    pub limited_user_reset_date: Option<String>,
}

/// Entry of `quota_snapshots`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawQuotaSnapshot {
    #[serde(default)]
    pub entitlement: f64,
    #[serde(default)]
    pub remaining: f64,
    #[serde(default)]
    pub percent_remaining: f64,
    #[serde(default)]
    pub overage_permitted: bool,
    #[serde(default)]
    pub overage_count: f64,
    #[serde(default)]
    pub unlimited: bool,
}

/// Legacy free-plan quota counters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyQuotas {
    #[serde(default)]
    pub chat: Option<f64>,
    #[serde(default)]
    pub completions: Option<f64>,
}

/// One row of the tier table
pub struct TierRule {
    pub name: &'static str,
    pub matches: fn(&EntitlementResponse) -> bool,
    pub tier: EntitlementTier,
}

fn plan_is(response: &EntitlementResponse, plan: &str) -> bool {
    response.plan.as_deref() == Some(plan)
}

/// Evaluated top to bottom; the first matching rule wins
pub const TIER_RULES: &[TierRule] = &[
    TierRule {
        name: "limited_free_sku",
        matches: |r| r.access_type_sku.as_deref() == Some(LIMITED_FREE_SKU),
        tier: EntitlementTier::Free,
    },
    TierRule {
        name: "can_signup_for_limited",
        matches: |r| r.can_signup_for_limited == Some(true),
        tier: EntitlementTier::Available,
    },
    TierRule {
        name: "plan_individual",
        matches: |r| plan_is(r, "individual"),
        tier: EntitlementTier::Pro,
    },
    TierRule {
        name: "plan_individual_pro",
        matches: |r| plan_is(r, "individual_pro"),
        tier: EntitlementTier::ProPlus,
    },
    TierRule {
        name: "plan_business",
        matches: |r| plan_is(r, "business"),
        tier: EntitlementTier::Business,
    },
    TierRule {
        name: "plan_enterprise",
        matches: |r| plan_is(r, "enterprise"),
        tier: EntitlementTier::Enterprise,
    },
    // Plans added server-side after this client shipped
    TierRule {
        name: "chat_enabled",
        matches: |r| r.chat_enabled == Some(true),
        tier: EntitlementTier::Pro,
    },
];

impl EntitlementResponse {
    /// Parse a response body; `None` for anything that isn't a JSON object
    /// of the expected shape
    pub fn parse(body: &str) -> Option<Self> {
        match serde_json::from_str::<EntitlementResponse>(body) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                log::trace!("[entitlement] error parsing response ({})", e);
                None
            }
        }
    }

    /// Map the payload to a tier using [`TIER_RULES`]
    pub fn tier(&self) -> EntitlementTier {
        TIER_RULES
            .iter()
            .find(|rule| (rule.matches)(self))
            .map(|rule| {
                log::trace!("[entitlement] tier rule {} matched", rule.name);
                rule.tier
            })
            .unwrap_or(EntitlementTier::Unavailable)
    }

    pub fn entitlement(&self) -> Entitlement {
        Entitlement::new(self.tier())
            .with_organisations(self.organization_login_list.clone())
            .with_sku(self.access_type_sku.clone())
    }

    /// Quotas carried by the payload.
    ///
    /// `quota_snapshots` entries override the legacy counters.
    pub fn quotas(&self) -> Quotas {
        let mut quotas = Quotas {
            reset_date: self
                .quota_reset_date_utc
                .clone()
                .or_else(|| self.quota_reset_date.clone())
                .or_else(|| self.limited_user_reset_date.clone()),
            reset_date_has_time: self.quota_reset_date_utc.is_some(),
            ..Default::default()
        };

        if let (Some(monthly), Some(limited)) = (&self.monthly_quotas, &self.limited_user_quotas) {
            if let (Some(total), Some(remaining)) = (monthly.chat, limited.chat) {
                if total != 0.0 {
                    quotas.chat = Some(QuotaSnapshot::from_remaining(total, remaining));
                }
            }
            if let (Some(total), Some(remaining)) = (monthly.completions, limited.completions) {
                if total != 0.0 {
                    quotas.completions = Some(QuotaSnapshot::from_remaining(total, remaining));
                }
            }
        }

        if let Some(snapshots) = &self.quota_snapshots {
            for (key, raw) in snapshots {
                let snapshot = QuotaSnapshot::new(raw.entitlement, raw.remaining, raw.percent_remaining)
                    .with_overage(raw.overage_permitted, raw.overage_count)
                    .with_unlimited(raw.unlimited);
                match key.as_str() {
                    "chat" => quotas.chat = Some(snapshot),
                    "completions" => quotas.completions = Some(snapshot),
                    "premium_interactions" => quotas.premium_chat = Some(snapshot),
                    other => log::trace!("[quota] ignoring unknown quota kind {}", other),
                }
            }
        }

        quotas
    }
}

// ============================================================================
// Sign-up endpoint
// ============================================================================

/// Body sent to the sign-up endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct SignUpRequest {
    pub telemetry_opt_out: bool,
    pub public_code_suggestions: &'static str,
}

impl SignUpRequest {
    pub fn new(telemetry_opt_out: bool) -> Self {
        Self {
            telemetry_opt_out,
            public_code_suggestions: "enabled",
        }
    }

    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "telemetry_opt_out": self.telemetry_opt_out,
            "public_code_suggestions": self.public_code_suggestions,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignUpResponse {
    #[serde(default)]
    pub subscribed: bool,
}

/// Structured 422 rejection
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignUpRejection {
    #[serde(default)]
    pub message: Option<String>,
}

impl SignUpRejection {
    /// Non-empty rejection message, if the body carried one
    pub fn parse_message(body: &str) -> Option<String> {
        serde_json::from_str::<SignUpRejection>(body)
            .ok()
            .and_then(|r| r.message)
            .filter(|m| !m.is_empty())
    }
}

// ============================================================================
// Usage endpoint
// ============================================================================

/// Body of the alternate backend's usage endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageResponse {
    #[serde(default)]
    pub quotas: Option<Quotas>,
}
