//! Quota tracking types
//!
//! Point-in-time usage records for the metered chat resources.

use serde::{Deserialize, Serialize};

// ============================================================================
// Quota Kinds
// ============================================================================

/// Metered resource a quota applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// Chat requests
    Chat,
    /// Inline completions
    Completions,
    /// Premium chat interactions
    PremiumChat,
}

impl QuotaKind {
    pub const ALL: [QuotaKind; 3] = [QuotaKind::Chat, QuotaKind::Completions, QuotaKind::PremiumChat];
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaKind::Chat => write!(f, "chat"),
            QuotaKind::Completions => write!(f, "completions"),
            QuotaKind::PremiumChat => write!(f, "premium_chat"),
        }
    }
}

impl std::str::FromStr for QuotaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(QuotaKind::Chat),
            "completions" => Ok(QuotaKind::Completions),
            "premium_chat" | "premium_interactions" | "premiumchat" => Ok(QuotaKind::PremiumChat),
            _ => Err(format!("Unknown quota kind: {}", s)),
        }
    }
}

// ============================================================================
// Snapshot Types
// ============================================================================

/// A point-in-time snapshot of one quota
///
/// Snapshots are immutable; every accepted update replaces them wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    /// Allowance for the current period
    pub total: f64,
    /// Remaining allowance
    pub remaining: f64,
    /// Remaining allowance as a percentage, clamped to 0..=100
    pub percent_remaining: f64,
    /// Whether usage beyond the allowance is billed instead of blocked
    #[serde(default)]
    pub overage_enabled: bool,
    /// Requests made beyond the allowance
    #[serde(default)]
    pub overage_count: f64,
    /// No allowance applies
    #[serde(default)]
    pub unlimited: bool,
}

impl QuotaSnapshot {
    /// Create a snapshot, clamping the percentage into range
    pub fn new(total: f64, remaining: f64, percent_remaining: f64) -> Self {
        Self {
            total,
            remaining,
            percent_remaining: clamp_percent(percent_remaining),
            overage_enabled: false,
            overage_count: 0.0,
            unlimited: false,
        }
    }

    /// Create a snapshot from an allowance and what is left of it
    pub fn from_remaining(total: f64, remaining: f64) -> Self {
        let percent = if total > 0.0 {
            (remaining / total) * 100.0
        } else {
            0.0
        };
        Self::new(total, remaining, percent)
    }

    /// Set overage info
    pub fn with_overage(mut self, enabled: bool, count: f64) -> Self {
        self.overage_enabled = enabled;
        self.overage_count = count;
        self
    }

    /// Mark this snapshot as unlimited
    pub fn with_unlimited(mut self, unlimited: bool) -> Self {
        self.unlimited = unlimited;
        self
    }

    /// The sole "exceeded" criterion
    pub fn is_exceeded(&self) -> bool {
        self.percent_remaining == 0.0
    }
}

pub(crate) fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

/// The full set of quotas known for the signed-in user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quotas {
    #[serde(default)]
    pub chat: Option<QuotaSnapshot>,
    #[serde(default)]
    pub completions: Option<QuotaSnapshot>,
    #[serde(default)]
    pub premium_chat: Option<QuotaSnapshot>,
    /// When the quotas reset, as reported by the server
    #[serde(default)]
    pub reset_date: Option<String>,
    /// Whether `reset_date` carries a time of day (UTC) and not only a date
    #[serde(default)]
    pub reset_date_has_time: bool,
}

impl Quotas {
    pub fn get(&self, kind: QuotaKind) -> Option<&QuotaSnapshot> {
        match kind {
            QuotaKind::Chat => self.chat.as_ref(),
            QuotaKind::Completions => self.completions.as_ref(),
            QuotaKind::PremiumChat => self.premium_chat.as_ref(),
        }
    }

    pub fn set(&mut self, kind: QuotaKind, snapshot: QuotaSnapshot) {
        match kind {
            QuotaKind::Chat => self.chat = Some(snapshot),
            QuotaKind::Completions => self.completions = Some(snapshot),
            QuotaKind::PremiumChat => self.premium_chat = Some(snapshot),
        }
    }

    pub fn is_empty(&self) -> bool {
        QuotaKind::ALL.iter().all(|k| self.get(*k).is_none())
    }

    /// Parse the reset date into a UTC timestamp when the server sent one
    pub fn reset_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let raw = self.reset_date.as_deref()?;
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&chrono::Utc));
        }
        chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_kind_display_and_parse() {
        assert_eq!(QuotaKind::PremiumChat.to_string(), "premium_chat");
        assert_eq!(
            "premium_interactions".parse::<QuotaKind>().unwrap(),
            QuotaKind::PremiumChat
        );
        assert!("tokens".parse::<QuotaKind>().is_err());
    }

    #[test]
    fn test_snapshot_clamps_percent() {
        assert_eq!(QuotaSnapshot::new(10.0, 12.0, 120.0).percent_remaining, 100.0);
        assert_eq!(QuotaSnapshot::new(10.0, -1.0, -5.0).percent_remaining, 0.0);
        assert_eq!(QuotaSnapshot::new(10.0, 0.0, f64::NAN).percent_remaining, 0.0);
    }

    #[test]
    fn test_snapshot_from_remaining() {
        let snapshot = QuotaSnapshot::from_remaining(50.0, 10.0);
        assert!((snapshot.percent_remaining - 20.0).abs() < 0.001);
        assert!(!snapshot.is_exceeded());

        let exhausted = QuotaSnapshot::from_remaining(50.0, 0.0);
        assert!(exhausted.is_exceeded());
    }

    #[test]
    fn test_quotas_get_set() {
        let mut quotas = Quotas::default();
        assert!(quotas.is_empty());

        quotas.set(QuotaKind::Completions, QuotaSnapshot::new(100.0, 50.0, 50.0));
        assert!(!quotas.is_empty());
        assert!(quotas.get(QuotaKind::Completions).is_some());
        assert!(quotas.get(QuotaKind::Chat).is_none());
    }

    #[test]
    fn test_reset_at_parses_both_shapes() {
        let with_time = Quotas {
            reset_date: Some("2025-03-01T00:00:00Z".to_string()),
            reset_date_has_time: true,
            ..Default::default()
        };
        assert!(with_time.reset_at().is_some());

        let date_only = Quotas {
            reset_date: Some("2025-03-01".to_string()),
            ..Default::default()
        };
        assert!(date_only.reset_at().is_some());

        let garbage = Quotas {
            reset_date: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(garbage.reset_at().is_none());
    }

    #[test]
    fn test_quotas_deserialize_camel_case() {
        let json = r#"{
            "chat": { "total": 50, "remaining": 0, "percentRemaining": 0 },
            "premiumChat": { "total": 300, "remaining": 150, "percentRemaining": 50,
                             "overageEnabled": true, "overageCount": 2, "unlimited": false }
        }"#;
        let quotas: Quotas = serde_json::from_str(json).unwrap();
        assert!(quotas.chat.as_ref().unwrap().is_exceeded());
        assert!(quotas.premium_chat.as_ref().unwrap().overage_enabled);
        assert!(quotas.completions.is_none());
    }
}
