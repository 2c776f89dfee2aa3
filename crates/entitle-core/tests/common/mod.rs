//! Shared fakes for entitle-core integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use entitle_core::entitlement::{
    Account, AlternateIdentityBackend, AuthenticationService, DialogService, HttpRequest,
    HttpResponse, HttpTransport,
};
use entitle_core::models::{ModelError, ModelInfo, ModelProvider};
use entitle_core::{
    ChatEntitlementService, EntitlementConfig, Emitter, Error, MemoryStateStore, Result, Session,
};

pub fn session(id: &str, token: &str) -> Session {
    Session::new(id, "octocat", &["user:email"], token)
}

// ============================================================================
// Authentication
// ============================================================================

#[derive(Default)]
pub struct FakeAuth {
    sessions: Mutex<Vec<Session>>,
    created: Mutex<Option<Session>>,
    events: Emitter,
}

impl FakeAuth {
    pub fn with_sessions(sessions: Vec<Session>) -> Arc<Self> {
        let auth = Self::default();
        *auth.sessions.lock().unwrap() = sessions;
        Arc::new(auth)
    }

    /// Replace the sessions and notify listeners
    pub fn set_sessions(&self, sessions: Vec<Session>) {
        *self.sessions.lock().unwrap() = sessions;
        self.events.fire();
    }

    /// Session created (and announced) by the next interactive sign-in
    pub fn will_create(&self, session: Session) {
        *self.created.lock().unwrap() = Some(session);
    }
}

#[async_trait]
impl AuthenticationService for FakeAuth {
    async fn get_accounts(&self, _provider_id: &str) -> Result<Vec<Account>> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions.iter().map(|s| s.account.clone()).collect())
    }

    async fn get_sessions(
        &self,
        _provider_id: &str,
        account: Option<&Account>,
    ) -> Result<Vec<Session>> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions
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
    ) -> Result<Session> {
        let session = self
            .created
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::auth("User declined"))?;
        // Hosts announce a new session before handing it back
        self.sessions.lock().unwrap().push(session.clone());
        self.events.fire();
        Ok(session)
    }

    fn on_did_change_sessions(&self) -> &Emitter {
        &self.events
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Clone)]
struct Scripted {
    delay: Duration,
    response: HttpResponse,
}

/// Answers by bearer token, optionally after a delay
#[derive(Default)]
pub struct FakeTransport {
    by_token: Mutex<HashMap<String, Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, token: &str, status: u16, body: &str) {
        self.respond_after(token, Duration::ZERO, status, body);
    }

    pub fn respond_after(&self, token: &str, delay: Duration, status: u16, body: &str) {
        self.by_token.lock().unwrap().insert(
            token.to_string(),
            Scripted {
                delay,
                response: HttpResponse::new(status, body),
            },
        );
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let scripted = self
            .by_token
            .lock()
            .unwrap()
            .get(&request.bearer_token)
            .cloned();
        self.requests.lock().unwrap().push(request);

        let scripted = scripted.ok_or_else(|| Error::transport("connection refused"))?;
        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }
        Ok(scripted.response)
    }
}

// ============================================================================
// Dialogs
// ============================================================================

#[derive(Default)]
pub struct RecordingDialogs {
    pub retries_left: Mutex<u32>,
    pub prompts: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingDialogs {
    pub fn retrying(times: u32) -> Arc<Self> {
        let dialogs = Self::default();
        *dialogs.retries_left.lock().unwrap() = times;
        Arc::new(dialogs)
    }
}

#[async_trait]
impl DialogService for RecordingDialogs {
    async fn confirm_retry(&self, _message: &str, detail: &str) -> bool {
        self.prompts.lock().unwrap().push(detail.to_string());
        let mut left = self.retries_left.lock().unwrap();
        if *left == 0 {
            return false;
        }
        *left -= 1;
        true
    }

    async fn show_error(&self, _message: &str, detail: &str) {
        self.errors.lock().unwrap().push(detail.to_string());
    }
}

// ============================================================================
// Alternate backend
// ============================================================================

#[derive(Default)]
pub struct FakeAlternate {
    authenticated: AtomicBool,
    events: Emitter,
}

impl FakeAlternate {
    pub fn new(authenticated: bool) -> Arc<Self> {
        let alternate = Self::default();
        alternate.authenticated.store(authenticated, Ordering::SeqCst);
        Arc::new(alternate)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
        self.events.fire();
    }
}

#[async_trait]
impl AlternateIdentityBackend for FakeAlternate {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn session_token(&self) -> Option<String> {
        self.is_authenticated().then(|| "alt-token".to_string())
    }

    async fn sign_in(&self) -> Result<Session> {
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(Session::new("alt", "alt-user", &[], "alt-token"))
    }

    fn on_did_change_session(&self) -> &Emitter {
        &self.events
    }
}

// ============================================================================
// Model providers
// ============================================================================

pub struct StaticProvider {
    models: Vec<ModelInfo>,
    delay: Duration,
    calls: Mutex<usize>,
}

impl StaticProvider {
    pub fn new(models: Vec<ModelInfo>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            models,
            delay,
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ModelProvider for StaticProvider {
    async fn provide_models(&self, _allow_prompting: bool) -> std::result::Result<Vec<ModelInfo>, ModelError> {
        *self.calls.lock().unwrap() += 1;
        tokio::time::sleep(self.delay).await;
        Ok(self.models.clone())
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct Harness {
    pub service: Arc<ChatEntitlementService>,
    pub auth: Arc<FakeAuth>,
    pub transport: Arc<FakeTransport>,
    pub dialogs: Arc<RecordingDialogs>,
    pub store: Arc<MemoryStateStore>,
}

pub fn harness(sessions: Vec<Session>) -> Harness {
    harness_with(EntitlementConfig::default(), sessions, None)
}

pub fn harness_with(
    config: EntitlementConfig,
    sessions: Vec<Session>,
    alternate: Option<Arc<FakeAlternate>>,
) -> Harness {
    let auth = FakeAuth::with_sessions(sessions);
    let transport = FakeTransport::new();
    let dialogs = Arc::new(RecordingDialogs::default());
    let store = Arc::new(MemoryStateStore::new());

    let mut builder = ChatEntitlementService::builder(config)
        .store(store.clone())
        .auth(auth.clone())
        .transport(transport.clone())
        .dialogs(dialogs.clone());
    if let Some(alternate) = alternate {
        builder = builder.alternate(alternate);
    }
    let service = builder.build().expect("service builds");

    Harness {
        service,
        auth,
        transport,
        dialogs,
        store,
    }
}

/// Let spawned listener tasks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
