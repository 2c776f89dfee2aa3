//! Configuration for entitlement resolution
//!
//! Settings are read from a JSON file in the platform config directory
//! (or `ENTITLE_CONFIG`), then a handful of boolean flags can be overridden
//! from the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Delay before a pending readiness wait reports "taking longer than expected"
pub const DEFAULT_READY_WARNING_SECS: u64 = 10;

/// Hard readiness timeout for local sessions
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 20;

/// Hard readiness timeout when running against a remote host
pub const DEFAULT_REMOTE_READY_TIMEOUT_SECS: u64 = 60;

/// HTTP request timeout
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_ENTITLEMENT_URL: &str = "https://api.github.com/copilot_internal/user";
const DEFAULT_SIGNUP_URL: &str = "https://api.github.com/copilot_internal/subscribe_limited_user";
const DEFAULT_USAGE_URL: &str = "https://api.entitle.dev/v1/usage";

// ============================================================================
// EntitlementConfig
// ============================================================================

/// Effective configuration of the entitlement subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementConfig {
    /// Identity provider used for regular sign-in
    pub default_provider_id: String,
    /// Identity provider used when the enterprise provider is selected
    pub enterprise_provider_id: String,
    /// Provider selected by the user; `None` means the default provider
    pub auth_provider: Option<String>,
    /// Enterprise host URI, used to derive the enterprise entitlement URL
    pub provider_uri: Option<String>,
    /// Acceptable scope sets; a session matches if it covers any one of them
    pub provider_scopes: Vec<Vec<String>>,
    /// Sign in with the last scope set instead of the first
    pub sign_in_with_alternate_scopes: bool,
    pub entitlement_url: String,
    pub signup_url: String,
    /// Usage endpoint of the alternate identity backend
    pub usage_url: String,
    /// Organisations whose members count as internal users
    pub internal_organisations: Vec<String>,
    /// Offer chat to signed-out users
    pub allow_anonymous_access: bool,
    /// Hide every AI surface regardless of stored state
    pub disable_ai_features: bool,
    /// Show every model in pickers regardless of per-model overrides
    pub show_all_models: bool,
    /// Sent with the free-plan sign-up
    pub telemetry_opt_out: bool,
    pub request_timeout_secs: u64,
    pub ready_warning_secs: u64,
    pub ready_timeout_secs: u64,
    pub remote_ready_timeout_secs: u64,
    /// Running against a remote host (longer readiness timeout)
    pub remote: bool,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            default_provider_id: "github".to_string(),
            enterprise_provider_id: "github-enterprise".to_string(),
            auth_provider: None,
            provider_uri: None,
            provider_scopes: vec![
                vec!["user:email".to_string()],
                vec!["read:user".to_string()],
            ],
            sign_in_with_alternate_scopes: false,
            entitlement_url: DEFAULT_ENTITLEMENT_URL.to_string(),
            signup_url: DEFAULT_SIGNUP_URL.to_string(),
            usage_url: DEFAULT_USAGE_URL.to_string(),
            internal_organisations: vec![
                "github".to_string(),
                "microsoft".to_string(),
                "ms-copilot".to_string(),
                "MicrosoftCopilot".to_string(),
            ],
            allow_anonymous_access: false,
            disable_ai_features: false,
            show_all_models: false,
            telemetry_opt_out: false,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            ready_warning_secs: DEFAULT_READY_WARNING_SECS,
            ready_timeout_secs: DEFAULT_READY_TIMEOUT_SECS,
            remote_ready_timeout_secs: DEFAULT_REMOTE_READY_TIMEOUT_SECS,
            remote: false,
        }
    }
}

impl EntitlementConfig {
    /// Validate and normalize the configuration
    pub fn validate(&self) -> Self {
        let mut config = self.clone();
        config.request_timeout_secs = config.request_timeout_secs.max(1);
        config.ready_warning_secs = config.ready_warning_secs.max(1);
        config.ready_timeout_secs = config.ready_timeout_secs.max(config.ready_warning_secs);
        config.remote_ready_timeout_secs =
            config.remote_ready_timeout_secs.max(config.ready_warning_secs);
        if config.provider_scopes.is_empty() {
            config.provider_scopes.push(Vec::new());
        }
        config.auth_provider = config.auth_provider.filter(|p| !p.is_empty());
        config
    }

    /// The identity provider currently in effect
    pub fn provider_id(&self) -> &str {
        match self.auth_provider.as_deref() {
            Some(p) if p == self.enterprise_provider_id => &self.enterprise_provider_id,
            _ => &self.default_provider_id,
        }
    }

    /// Whether the enterprise provider is selected
    pub fn is_enterprise(&self) -> bool {
        self.provider_id() == self.enterprise_provider_id
    }

    /// Entitlement endpoint, derived from the enterprise host when selected
    pub fn resolved_entitlement_url(&self) -> String {
        if self.is_enterprise() {
            if let Some(uri) = self.provider_uri.as_deref() {
                match enterprise_entitlement_url(uri) {
                    Some(url) => return url,
                    None => log::error!("[entitlement] Invalid enterprise provider URI: {}", uri),
                }
            }
        }
        self.entitlement_url.clone()
    }

    /// Hard readiness timeout for the current environment
    pub fn ready_timeout(&self) -> std::time::Duration {
        let secs = if self.remote {
            self.remote_ready_timeout_secs
        } else {
            self.ready_timeout_secs
        };
        std::time::Duration::from_secs(secs)
    }

    pub fn ready_warning(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ready_warning_secs)
    }

    /// Base scope set requested when signing in
    pub fn sign_in_scopes(&self) -> Vec<String> {
        let scopes = if self.sign_in_with_alternate_scopes {
            self.provider_scopes.last()
        } else {
            self.provider_scopes.first()
        };
        scopes.cloned().unwrap_or_default()
    }

    /// Apply `ENTITLE_*` boolean overrides from the environment
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_flag("ENTITLE_ALLOW_ANONYMOUS") {
            self.allow_anonymous_access = v;
        }
        if let Some(v) = env_flag("ENTITLE_DISABLE_AI") {
            self.disable_ai_features = v;
        }
        if let Some(v) = env_flag("ENTITLE_SHOW_ALL_MODELS") {
            self.show_all_models = v;
        }
        if let Some(v) = env_flag("ENTITLE_TELEMETRY_OPT_OUT") {
            self.telemetry_opt_out = v;
        }
        self
    }
}

/// `https://ghe.example.com:8443` -> `https://api.ghe.example.com:8443/copilot_internal/user`
fn enterprise_entitlement_url(uri: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(uri).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    Some(format!(
        "{}://api.{}{}/copilot_internal/user",
        parsed.scheme(),
        host,
        port
    ))
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("[entitlement] Ignoring invalid value for {}: {}", key, value);
            None
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Get configuration file path
/// Priority: ENTITLE_CONFIG env var > default config directory
pub fn get_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("ENTITLE_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    let dirs = directories::ProjectDirs::from("com", "entitle", "Entitle")
        .ok_or_else(|| Error::config("Could not determine project directories"))?;

    Ok(dirs.config_dir().join("config.json"))
}

/// Load configuration from the default location
pub fn load_config() -> Result<EntitlementConfig> {
    load_config_from(&get_config_path()?)
}

/// Load configuration from a file; a missing file yields the defaults
pub fn load_config_from(path: &Path) -> Result<EntitlementConfig> {
    let config = if path.exists() {
        log::debug!("[entitlement] Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str::<EntitlementConfig>(&content)?
    } else {
        log::debug!(
            "[entitlement] No configuration at {}, using defaults",
            path.display()
        );
        EntitlementConfig::default()
    };

    Ok(config.apply_env_overrides().validate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var tests must not run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let config = EntitlementConfig::default();
        assert_eq!(config.provider_id(), "github");
        assert!(!config.is_enterprise());
        assert!(!config.allow_anonymous_access);
        assert_eq!(config.ready_warning_secs, DEFAULT_READY_WARNING_SECS);
        assert_eq!(config.ready_timeout().as_secs(), DEFAULT_READY_TIMEOUT_SECS);
    }

    #[test]
    fn test_remote_uses_longer_timeout() {
        let config = EntitlementConfig {
            remote: true,
            ..Default::default()
        };
        assert_eq!(
            config.ready_timeout().as_secs(),
            DEFAULT_REMOTE_READY_TIMEOUT_SECS
        );
    }

    #[test]
    fn test_validate_normalizes() {
        let config = EntitlementConfig {
            request_timeout_secs: 0,
            ready_warning_secs: 30,
            ready_timeout_secs: 5,
            provider_scopes: vec![],
            auth_provider: Some(String::new()),
            ..Default::default()
        };

        let validated = config.validate();
        assert_eq!(validated.request_timeout_secs, 1);
        assert_eq!(validated.ready_timeout_secs, 30);
        assert_eq!(validated.provider_scopes, vec![Vec::<String>::new()]);
        assert!(validated.auth_provider.is_none());
    }

    #[test]
    fn test_enterprise_entitlement_url() {
        let config = EntitlementConfig {
            auth_provider: Some("github-enterprise".to_string()),
            provider_uri: Some("https://ghe.example.com:8443".to_string()),
            ..Default::default()
        };
        assert!(config.is_enterprise());
        assert_eq!(
            config.resolved_entitlement_url(),
            "https://api.ghe.example.com:8443/copilot_internal/user"
        );
    }

    #[test]
    fn test_invalid_enterprise_uri_falls_back() {
        let config = EntitlementConfig {
            auth_provider: Some("github-enterprise".to_string()),
            provider_uri: Some("not a uri".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolved_entitlement_url(), DEFAULT_ENTITLEMENT_URL);
    }

    #[test]
    fn test_sign_in_scopes() {
        let mut config = EntitlementConfig::default();
        assert_eq!(config.sign_in_scopes(), vec!["user:email".to_string()]);

        config.sign_in_with_alternate_scopes = true;
        assert_eq!(config.sign_in_scopes(), vec!["read:user".to_string()]);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config.default_provider_id, "github");
    }

    #[test]
    fn test_load_partial_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "allow_anonymous_access": true, "show_all_models": true }"#)
            .unwrap();

        let config = load_config_from(&path).unwrap();
        assert!(config.allow_anonymous_access);
        assert!(config.show_all_models);
        assert_eq!(config.entitlement_url, DEFAULT_ENTITLEMENT_URL);
    }

    #[test]
    fn test_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::set_var("ENTITLE_DISABLE_AI", "true");
        let config = EntitlementConfig::default().apply_env_overrides();
        std::env::remove_var("ENTITLE_DISABLE_AI");
        assert!(config.disable_ai_features);
    }

    #[test]
    fn test_get_config_path_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::set_var("ENTITLE_CONFIG", "/tmp/entitle-test.json");
        let path = get_config_path().unwrap();
        std::env::remove_var("ENTITLE_CONFIG");
        assert_eq!(path.to_string_lossy(), "/tmp/entitle-test.json");
    }
}
