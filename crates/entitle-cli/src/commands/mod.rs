//! CLI commands module
//!
//! Contains all CLI command implementations and the collaborators they
//! wire into the core service.

pub mod config;
pub mod resolve;
pub mod setup;
pub mod sign_up;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use clap::Args;
use entitle_core::entitlement::{Account, AuthenticationService, DialogService};
use entitle_core::{ChatEntitlementService, EntitlementConfig, Emitter, FileStateStore, Session};

use crate::output::{print_error, OutputFormat};

/// Shared context for all commands
pub struct Context {
    pub config: EntitlementConfig,
    pub store: Arc<FileStateStore>,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Context {
    /// Build the service against the state file and the given sessions
    pub fn service(&self, auth: FileAuthService) -> Result<Arc<ChatEntitlementService>> {
        let service = ChatEntitlementService::builder(self.config.clone())
            .store(self.store.clone())
            .auth(Arc::new(auth))
            .dialogs(Arc::new(ConsoleDialogs))
            .build()?;
        Ok(service)
    }
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// JSON file with an array of sessions (or set ENTITLE_SESSIONS env var)
    #[arg(long, env = "ENTITLE_SESSIONS")]
    pub sessions: String,
}

impl SessionArgs {
    /// Sessions file path with `~` expanded
    pub fn path(&self) -> PathBuf {
        expand_path(&self.sessions)
    }
}

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Authentication service backed by a JSON session file
#[derive(Default)]
pub struct FileAuthService {
    sessions: Vec<Session>,
    events: Emitter,
}

impl FileAuthService {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sessions file {}", path.display()))?;
        let sessions: Vec<Session> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid sessions file {}", path.display()))?;
        log::debug!("Loaded {} session(s) from {}", sessions.len(), path.display());
        Ok(Self {
            sessions,
            events: Emitter::new(),
        })
    }

    /// No sessions; for commands that never talk to the network
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthenticationService for FileAuthService {
    async fn get_accounts(&self, _provider_id: &str) -> entitle_core::Result<Vec<Account>> {
        let mut accounts: Vec<Account> = Vec::new();
        for session in &self.sessions {
            if !accounts.contains(&session.account) {
                accounts.push(session.account.clone());
            }
        }
        Ok(accounts)
    }

    async fn get_sessions(
        &self,
        _provider_id: &str,
        account: Option<&Account>,
    ) -> entitle_core::Result<Vec<Session>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| account.map_or(true, |a| &s.account == a))
            .cloned()
            .collect())
    }

    async fn create_session(
        &self,
        _provider_id: &str,
        _scopes: &[String],
        _social_provider: Option<&str>,
    ) -> entitle_core::Result<Session> {
        Err(entitle_core::Error::auth(
            "Interactive sign-in is not available from the CLI",
        ))
    }

    fn on_did_change_sessions(&self) -> &Emitter {
        &self.events
    }
}

/// Dialogs on the terminal: errors go to stderr, retries are declined
pub struct ConsoleDialogs;

#[async_trait]
impl DialogService for ConsoleDialogs {
    async fn confirm_retry(&self, message: &str, detail: &str) -> bool {
        print_error(&format!("{} {}", message, detail));
        false
    }

    async fn show_error(&self, message: &str, detail: &str) {
        print_error(&format!("{} {}", message, detail));
    }
}
