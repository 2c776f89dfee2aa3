//! Chat entitlement service
//!
//! Facade that wires the context publisher, request coordinator, quota
//! accountant, readiness watchdog and model registry together and reacts
//! to collaborator events.

use std::future::Future;
use std::sync::{Arc, Weak};

use super::context::{ContextPublisher, PublisherSettings};
use super::http::{HttpTransport, ReqwestTransport};
use super::identity::{AlternateIdentityBackend, AuthenticationService, Session, SignInOptions};
use super::readiness::{LogReporter, Readiness, ReadinessReporter, ReadinessWatchdog};
use super::requests::{
    DialogService, EntitlementRequests, NoDialogs, ResolveOutcome, SignInResult, SignUpOutcome,
};
use super::storage::{FileStateStore, StateStore};
use super::types::{ContextFlags, EntitlementState, EntitlementTier, EntitlementUpdate};
use crate::config::EntitlementConfig;
use crate::error::{Error, Result};
use crate::events::{Emitter, Subscription};
use crate::models::ModelRegistry;
use crate::quota::{QuotaAccountant, QuotaFlags, Quotas};

/// Builder for [`ChatEntitlementService`]
pub struct ChatEntitlementServiceBuilder {
    config: EntitlementConfig,
    store: Option<Arc<dyn StateStore>>,
    auth: Option<Arc<dyn AuthenticationService>>,
    transport: Option<Arc<dyn HttpTransport>>,
    dialogs: Arc<dyn DialogService>,
    alternate: Option<Arc<dyn AlternateIdentityBackend>>,
    reporter: Arc<dyn ReadinessReporter>,
}

impl ChatEntitlementServiceBuilder {
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthenticationService>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn dialogs(mut self, dialogs: Arc<dyn DialogService>) -> Self {
        self.dialogs = dialogs;
        self
    }

    pub fn alternate(mut self, alternate: Arc<dyn AlternateIdentityBackend>) -> Self {
        self.alternate = Some(alternate);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ReadinessReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Build the service and subscribe to collaborator events.
    ///
    /// Defaults: the file state store, a reqwest transport and no dialogs.
    pub fn build(self) -> Result<Arc<ChatEntitlementService>> {
        let config = self.config.validate();
        let auth = self
            .auth
            .ok_or_else(|| Error::config("An authentication service is required"))?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(FileStateStore::open_default()?),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(std::time::Duration::from_secs(
                config.request_timeout_secs,
            ))?),
        };

        let context = Arc::new(ContextPublisher::new(
            store.clone(),
            PublisherSettings::from(&config),
        ));
        let quotas = Arc::new(QuotaAccountant::new());
        let requests = EntitlementRequests::new(
            &config,
            context.clone(),
            quotas.clone(),
            auth.clone(),
            transport,
            self.dialogs,
            self.alternate.clone(),
        );
        let unresolvable = Arc::new(Emitter::new());
        let watchdog = ReadinessWatchdog::new(&config, self.reporter, unresolvable.clone());
        let models = ModelRegistry::new(context.clone(), store, config.show_all_models);

        let service = Arc::new_cyclic(|weak: &Weak<ChatEntitlementService>| {
            let subscriptions = subscribe_all(
                weak,
                auth.as_ref(),
                &context,
                self.alternate.as_deref(),
            );
            ChatEntitlementService {
                config: std::sync::Mutex::new(config),
                context,
                quotas,
                requests,
                watchdog,
                models,
                alternate: self.alternate,
                unresolvable,
                _subscriptions: subscriptions,
            }
        });

        log::info!(
            "[entitlement] Service ready (provider: {}, tier: {})",
            service.requests.identity().provider_id(),
            service.tier()
        );
        Ok(service)
    }
}

fn subscribe_all(
    weak: &Weak<ChatEntitlementService>,
    auth: &dyn AuthenticationService,
    context: &ContextPublisher,
    alternate: Option<&dyn AlternateIdentityBackend>,
) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();

    let service = weak.clone();
    subscriptions.push(auth.on_did_change_sessions().subscribe(move || {
        if let Some(service) = service.upgrade() {
            log::debug!("[entitlement] Sessions changed");
            spawn(async move {
                service.resolve().await;
            });
        }
    }));

    let service = weak.clone();
    subscriptions.push(context.on_did_change().subscribe(move || {
        if let Some(service) = service.upgrade() {
            let flags = service.context.flags();
            if !flags.installed || flags.disabled || flags.tier == EntitlementTier::Unknown {
                service.quotas.clear();
            }
        }
    }));

    if let Some(alternate) = alternate {
        let service = weak.clone();
        subscriptions.push(alternate.on_did_change_session().subscribe(move || {
            if let Some(service) = service.upgrade() {
                service.alternate_session_changed();
            }
        }));
    }

    subscriptions
}

/// Run `future` on the current runtime, if there is one
fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => log::debug!("[entitlement] No async runtime, skipping background task"),
    }
}

/// Entitlement, sentiment and quota state for the chat feature
pub struct ChatEntitlementService {
    config: std::sync::Mutex<EntitlementConfig>,
    context: Arc<ContextPublisher>,
    quotas: Arc<QuotaAccountant>,
    requests: EntitlementRequests,
    watchdog: ReadinessWatchdog,
    models: ModelRegistry,
    alternate: Option<Arc<dyn AlternateIdentityBackend>>,
    unresolvable: Arc<Emitter>,
    _subscriptions: Vec<Subscription>,
}

impl ChatEntitlementService {
    pub fn builder(config: EntitlementConfig) -> ChatEntitlementServiceBuilder {
        ChatEntitlementServiceBuilder {
            config,
            store: None,
            auth: None,
            transport: None,
            dialogs: Arc::new(NoDialogs),
            alternate: None,
            reporter: Arc::new(LogReporter),
        }
    }

    /// Initial resolution under the readiness watchdog.
    ///
    /// Also fetches alternate-backend quotas when that backend is already
    /// signed in.
    pub async fn start(self: &Arc<Self>) -> Readiness<ResolveOutcome> {
        if self.alternate.as_ref().is_some_and(|alt| alt.is_authenticated()) {
            let service = self.clone();
            spawn(async move {
                service.refresh_alternate_quotas().await;
            });
        }

        let service = self.clone();
        self.watchdog
            .when_ready(async move { service.resolve().await })
            .await
    }

    pub async fn resolve(&self) -> ResolveOutcome {
        self.requests.resolve().await
    }

    pub async fn force_resolve(&self) -> ResolveOutcome {
        match self.requests.force_resolve(None).await {
            Some(resolved) => ResolveOutcome::Resolved(resolved),
            None => ResolveOutcome::Superseded,
        }
    }

    pub async fn sign_in(&self, options: SignInOptions) -> Result<SignInResult> {
        self.requests.sign_in(options).await
    }

    /// Sign up for the free plan with the currently matching sessions
    pub async fn sign_up_free(&self) -> Result<SignUpOutcome> {
        let token = tokio_util::sync::CancellationToken::new();
        let sessions = self
            .requests
            .identity()
            .find_matching_sessions(&token)
            .await
            .ok_or_else(|| Error::auth("Sign in before signing up"))?;
        Ok(self.sign_up_free_with(&sessions).await)
    }

    pub async fn sign_up_free_with(&self, sessions: &[Session]) -> SignUpOutcome {
        self.requests.sign_up_free(sessions).await
    }

    fn alternate_session_changed(self: Arc<Self>) {
        let signed_in = self
            .alternate
            .as_ref()
            .is_some_and(|alt| alt.is_authenticated());
        log::info!(
            "[entitlement] Alternate backend signed {}",
            if signed_in { "in" } else { "out" }
        );
        self.requests.publish_alternate(signed_in);
        if signed_in {
            spawn(async move {
                self.refresh_alternate_quotas().await;
            });
        }
    }

    async fn refresh_alternate_quotas(&self) {
        if let Err(e) = self.requests.fetch_alternate_quotas().await {
            log::warn!("[quota] Failed to fetch alternate quotas: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Explicit setup actions
    // ------------------------------------------------------------------

    pub fn accept_setup(&self) -> bool {
        self.context
            .update(EntitlementUpdate::new().with_hidden(false).with_later(false))
    }

    pub fn decline_setup(&self) -> bool {
        self.context.update(EntitlementUpdate::new().with_hidden(true))
    }

    pub fn setup_later(&self) -> bool {
        self.context.update(EntitlementUpdate::new().with_later(true))
    }

    pub fn extension_state_changed(&self, installed: bool, disabled: bool, untrusted: bool) -> bool {
        self.context
            .update(EntitlementUpdate::extension(installed, disabled, untrusted))
    }

    /// Apply changed settings: hidden-by-disable, anonymous access, the
    /// internal organisation list and the show-all-models override
    pub fn update_configuration(&self, config: EntitlementConfig) {
        let config = config.validate();
        self.context.update_settings(PublisherSettings::from(&config));
        self.models.set_show_all_models(config.show_all_models);
        *self.config.lock().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Stop dialogs and cancel in-flight work
    pub fn shutdown(&self) {
        self.requests.set_shutting_down(true);
        self.requests.cancel();
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn config(&self) -> EntitlementConfig {
        self.config.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn context(&self) -> &Arc<ContextPublisher> {
        &self.context
    }

    pub fn state(&self) -> EntitlementState {
        self.context.state()
    }

    pub fn flags(&self) -> ContextFlags {
        self.context.flags()
    }

    pub fn tier(&self) -> EntitlementTier {
        self.context.flags().tier
    }

    pub fn organisations(&self) -> Option<Vec<String>> {
        self.context.flags().organisations
    }

    pub fn is_internal(&self) -> bool {
        self.context.flags().internal
    }

    pub fn sku(&self) -> Option<String> {
        self.context.flags().sku
    }

    pub fn anonymous(&self) -> bool {
        self.context.flags().anonymous
    }

    pub fn quotas(&self) -> Quotas {
        self.quotas.quotas()
    }

    pub fn quota_flags(&self) -> QuotaFlags {
        self.quotas.flags()
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn on_did_change_entitlement(&self) -> &Emitter {
        self.context.on_did_change_entitlement()
    }

    pub fn on_did_change_sentiment(&self) -> &Emitter {
        self.context.on_did_change_sentiment()
    }

    pub fn on_did_change_anonymous(&self) -> &Emitter {
        self.context.on_did_change_anonymous()
    }

    pub fn on_did_change_quota_exceeded(&self) -> &Emitter {
        self.quotas.on_did_change_quota_exceeded()
    }

    pub fn on_did_change_quota_remaining(&self) -> &Emitter {
        self.quotas.on_did_change_quota_remaining()
    }

    /// Fires when the initial resolution misses the hard timeout
    pub fn on_did_change_unresolvable(&self) -> &Emitter {
        &self.unresolvable
    }
}

impl std::fmt::Debug for ChatEntitlementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEntitlementService")
            .field("context", &self.context)
            .field("requests", &self.requests)
            .field("watchdog", &self.watchdog)
            .finish()
    }
}
