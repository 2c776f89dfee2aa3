//! Identity resolution
//!
//! Finds authenticated sessions for the configured provider that carry an
//! acceptable scope set, and creates new sessions on sign-in.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::EntitlementConfig;
use crate::error::Result;
use crate::events::Emitter;

/// Account a session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub label: String,
}

/// Identity-provider credential. Borrowed for the length of one request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub account: Account,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub access_token: String,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        account_label: impl Into<String>,
        scopes: &[&str],
        access_token: impl Into<String>,
    ) -> Self {
        let label = account_label.into();
        Self {
            id: id.into(),
            account: Account {
                id: label.clone(),
                label,
            },
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            access_token: access_token.into(),
        }
    }

    /// Whether this session holds every scope in `expected`
    pub fn includes_scopes(&self, expected: &[String]) -> bool {
        expected.iter().all(|scope| self.scopes.contains(scope))
    }
}

// Keep tokens out of logs
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("account", &self.account.label)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Host authentication service for the primary identity provider
#[async_trait]
pub trait AuthenticationService: Send + Sync {
    /// Accounts known for `provider_id`
    async fn get_accounts(&self, provider_id: &str) -> Result<Vec<Account>>;

    /// Sessions for `provider_id`, restricted to `account` when given.
    /// Fails when the provider is not registered.
    async fn get_sessions(&self, provider_id: &str, account: Option<&Account>)
        -> Result<Vec<Session>>;

    /// Interactively create a session. Fails when the user declines.
    async fn create_session(
        &self,
        provider_id: &str,
        scopes: &[String],
        social_provider: Option<&str>,
    ) -> Result<Session>;

    /// Fires when sessions, accounts or registered providers change
    fn on_did_change_sessions(&self) -> &Emitter;
}

/// A secondary identity backend that grants a default tier without an
/// entitlement query
#[async_trait]
pub trait AlternateIdentityBackend: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Bearer token for the usage endpoint
    fn session_token(&self) -> Option<String>;

    /// Interactive sign-in through the backend
    async fn sign_in(&self) -> Result<Session>;

    /// Fires when the backend signs in or out
    fn on_did_change_session(&self) -> &Emitter;
}

/// Options for an interactive sign-in
#[derive(Debug, Clone, Default)]
pub struct SignInOptions {
    /// Scopes requested on top of the configured base set
    pub additional_scopes: Vec<String>,
    /// Sign in through the alternate backend instead of the primary provider
    pub use_alternate_backend: bool,
    /// Social login hint passed to the primary provider
    pub social_provider: Option<String>,
}

/// Looks up and creates sessions for the configured provider
pub struct IdentityResolver {
    provider_id: String,
    scopes: Vec<Vec<String>>,
    sign_in_scopes: Vec<String>,
    auth: std::sync::Arc<dyn AuthenticationService>,
    preferred_account: Mutex<Option<String>>,
}

impl IdentityResolver {
    pub fn new(config: &EntitlementConfig, auth: std::sync::Arc<dyn AuthenticationService>) -> Self {
        Self {
            provider_id: config.provider_id().to_string(),
            scopes: config.provider_scopes.clone(),
            sign_in_scopes: config.sign_in_scopes(),
            auth,
            preferred_account: Mutex::new(None),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn auth(&self) -> &dyn AuthenticationService {
        self.auth.as_ref()
    }

    pub fn preferred_account(&self) -> Option<String> {
        self.preferred_account.lock().ok().and_then(|p| p.clone())
    }

    pub fn set_preferred_account(&self, label: Option<String>) {
        if let Ok(mut preferred) = self.preferred_account.lock() {
            *preferred = label;
        }
    }

    /// Every session matching any configured scope set, or `None`.
    ///
    /// All matches are returned because a matching session may still carry
    /// an expired token; callers try them in order.
    pub async fn find_matching_sessions(&self, token: &CancellationToken) -> Option<Vec<Session>> {
        let sessions = self.sessions_for_preferred_account().await;
        if token.is_cancelled() {
            return None;
        }

        let mut matching: Vec<Session> = Vec::new();
        for session in sessions {
            let accepted = self.scopes.iter().any(|set| session.includes_scopes(set));
            if accepted && !matching.iter().any(|m| m.id == session.id) {
                matching.push(session);
            }
        }

        log::debug!(
            "[entitlement:identity] {} matching session(s) for {}",
            matching.len(),
            self.provider_id
        );
        if matching.is_empty() {
            None
        } else {
            Some(matching)
        }
    }

    async fn sessions_for_preferred_account(&self) -> Vec<Session> {
        let preferred_label = self.preferred_account();
        let preferred = match &preferred_label {
            Some(label) => match self.auth.get_accounts(&self.provider_id).await {
                Ok(accounts) => accounts.into_iter().find(|a| &a.label == label),
                Err(_) => None,
            },
            None => None,
        };

        match self.auth.get_sessions(&self.provider_id, preferred.as_ref()).await {
            Ok(sessions) => sessions,
            Err(e) => {
                // Providers that are not registered yet fail here
                log::trace!("[entitlement:identity] get_sessions failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Scopes requested by an interactive sign-in
    pub fn scopes_for(&self, additional: &[String]) -> Vec<String> {
        let mut scopes = self.sign_in_scopes.clone();
        for scope in additional {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        scopes
    }

    /// Create a session against the primary provider and remember its account
    pub async fn create_session(&self, options: &SignInOptions) -> Result<Session> {
        let scopes = self.scopes_for(&options.additional_scopes);
        log::info!(
            "[entitlement:identity] Creating session for {} with scopes {:?}",
            self.provider_id,
            scopes
        );

        let session = self
            .auth
            .create_session(&self.provider_id, &scopes, options.social_provider.as_deref())
            .await?;
        self.set_preferred_account(Some(session.account.label.clone()));
        Ok(session)
    }
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("provider_id", &self.provider_id)
            .field("scopes", &self.scopes)
            .finish()
    }
}
