//! Entitlement request coordinator
//!
//! Turns session changes and explicit actions into entitlement lookups and
//! publishes the outcome through the [`ContextPublisher`].
//!
//! Every lookup is an attempt with its own cancellation token. Starting an
//! attempt cancels the previous one, and a result is only published while
//! its attempt is still the newest, so late responses from superseded
//! attempts are dropped.
//!
//! An interactive sign-in changes the sessions it then looks up. A
//! [`resolve`](EntitlementRequests::resolve) triggered meanwhile waits for
//! the sign-in to finish instead of cancelling its lookup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::context::ContextPublisher;
use super::http::{get_json, request_with_sessions, HttpRequest, HttpTransport, SessionsOutcome};
use super::identity::{
    AlternateIdentityBackend, AuthenticationService, IdentityResolver, Session, SignInOptions,
};
use super::response::{EntitlementResponse, SignUpRejection, SignUpRequest, SignUpResponse, UsageResponse};
use super::types::{Entitlement, EntitlementTier, EntitlementUpdate};
use crate::config::EntitlementConfig;
use crate::error::{Error, Result};
use crate::quota::{QuotaAccountant, Quotas};

/// SKU published for users signed in through the alternate backend
pub const ALTERNATE_FREE_SKU: &str = "alternate-free";

const SIGN_UP_ERROR_MESSAGE: &str =
    "An error occurred while signing up for the free plan. Would you like to try again?";
const SIGN_UP_REJECTED_MESSAGE: &str = "An error occurred while signing up for the free plan.";

/// User-facing confirm/retry prompts for explicit sign-in and sign-up
#[async_trait]
pub trait DialogService: Send + Sync {
    /// Ask whether to retry a failed action; `true` retries
    async fn confirm_retry(&self, message: &str, detail: &str) -> bool;

    /// Show an error whose `detail` is displayed verbatim
    async fn show_error(&self, message: &str, detail: &str);
}

/// Dialogs for non-interactive use: never retries, logs errors
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDialogs;

#[async_trait]
impl DialogService for NoDialogs {
    async fn confirm_retry(&self, message: &str, detail: &str) -> bool {
        log::debug!("[entitlement] Not retrying: {} ({})", message, detail);
        false
    }

    async fn show_error(&self, message: &str, detail: &str) {
        log::error!("[entitlement] {} {}", message, detail);
    }
}

/// Entitlement and quotas learned from one lookup
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntitlement {
    pub entitlement: Entitlement,
    pub quotas: Option<Quotas>,
}

impl ResolvedEntitlement {
    fn tier(tier: EntitlementTier) -> Self {
        Self {
            entitlement: Entitlement::new(tier),
            quotas: None,
        }
    }
}

/// How a call to [`EntitlementRequests::resolve`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// The alternate backend is signed in; no lookup was made
    Alternate,
    /// No matching session; `Unknown` was published
    SignedOut,
    /// Sessions exist and an earlier lookup already succeeded
    AlreadyResolved,
    Resolved(ResolvedEntitlement),
    /// A newer attempt took over; nothing was published
    Superseded,
}

/// Result of the free-plan sign-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// Signed up, or already was. `subscribed` is what the server reported.
    Success { subscribed: bool },
    /// Gave up. `code` is the HTTP status, or 1 (no response), 2 (empty
    /// body), 3 (unparsable body).
    Failed { code: u16 },
}

/// Result of an interactive sign-in
#[derive(Debug, Clone)]
pub struct SignInResult {
    pub session: Session,
    pub entitlement: Option<ResolvedEntitlement>,
}

struct Fetched {
    resolved: ResolvedEntitlement,
    /// The server answered with a usable payload
    definitive: bool,
}

struct Attempts {
    current: u64,
    token: CancellationToken,
    /// Cancelled when the most recent sign-in has finished
    sign_in_done: Option<CancellationToken>,
}

impl Attempts {
    fn is_current(&self, attempt: &Attempt) -> bool {
        self.current == attempt.id && !attempt.token.is_cancelled()
    }
}

/// One resolution attempt
#[derive(Debug, Clone)]
pub struct Attempt {
    id: u64,
    token: CancellationToken,
}

impl Attempt {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Coordinates session discovery, entitlement lookup and publication
pub struct EntitlementRequests {
    context: Arc<ContextPublisher>,
    quotas: Arc<QuotaAccountant>,
    identity: IdentityResolver,
    transport: Arc<dyn HttpTransport>,
    dialogs: Arc<dyn DialogService>,
    alternate: Option<Arc<dyn AlternateIdentityBackend>>,
    entitlement_url: String,
    signup_url: String,
    usage_url: String,
    telemetry_opt_out: bool,
    attempts: Mutex<Attempts>,
    /// Set after a successful lookup, cleared when sessions disappear
    did_resolve: AtomicBool,
    shutting_down: AtomicBool,
}

impl EntitlementRequests {
    pub fn new(
        config: &EntitlementConfig,
        context: Arc<ContextPublisher>,
        quotas: Arc<QuotaAccountant>,
        auth: Arc<dyn AuthenticationService>,
        transport: Arc<dyn HttpTransport>,
        dialogs: Arc<dyn DialogService>,
        alternate: Option<Arc<dyn AlternateIdentityBackend>>,
    ) -> Self {
        Self {
            context,
            quotas,
            identity: IdentityResolver::new(config, auth),
            transport,
            dialogs,
            alternate,
            entitlement_url: config.resolved_entitlement_url(),
            signup_url: config.signup_url.clone(),
            usage_url: config.usage_url.clone(),
            telemetry_opt_out: config.telemetry_opt_out,
            attempts: Mutex::new(Attempts {
                current: 0,
                token: CancellationToken::new(),
                sign_in_done: None,
            }),
            did_resolve: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn entitlement_url(&self) -> &str {
        &self.entitlement_url
    }

    /// Suppress dialogs; used while the host shuts down
    pub fn set_shutting_down(&self, shutting_down: bool) {
        self.shutting_down.store(shutting_down, Ordering::SeqCst);
    }

    fn lock_attempts(&self) -> MutexGuard<'_, Attempts> {
        self.attempts.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cancel the in-flight attempt and start a new one
    pub fn begin_attempt(&self) -> Attempt {
        let mut attempts = self.lock_attempts();
        attempts.token.cancel();
        attempts.current += 1;
        attempts.token = CancellationToken::new();
        log::trace!("[entitlement] Starting attempt {}", attempts.current);
        Attempt {
            id: attempts.current,
            token: attempts.token.clone(),
        }
    }

    /// Cancel whatever is in flight without starting anything
    pub fn cancel(&self) {
        self.lock_attempts().token.cancel();
    }

    /// Mark a sign-in as running until the returned guard is dropped
    fn begin_sign_in(&self) -> DropGuard {
        let done = CancellationToken::new();
        self.lock_attempts().sign_in_done = Some(done.clone());
        done.drop_guard()
    }

    async fn wait_for_sign_in(&self) {
        let pending = self.lock_attempts().sign_in_done.clone();
        if let Some(done) = pending {
            if !done.is_cancelled() {
                log::debug!("[entitlement] Waiting for the sign-in in progress");
                done.cancelled().await;
            }
        }
    }

    /// Publish `update` (and `quotas`) only if `attempt` is still the newest.
    ///
    /// Each write happens under the attempt lock so a superseded attempt
    /// never overwrites a newer result. Events fire after the lock is
    /// released, so listeners may start or cancel attempts synchronously.
    fn publish_if_current(
        &self,
        attempt: &Attempt,
        update: EntitlementUpdate,
        quotas: Option<Quotas>,
    ) -> bool {
        {
            let attempts = self.lock_attempts();
            if !attempts.is_current(attempt) {
                log::trace!(
                    "[entitlement] Dropping result of attempt {} (newest is {})",
                    attempt.id,
                    attempts.current
                );
                return false;
            }
            self.context.suspend();
            self.context.update(update);
        }
        self.context.resume();

        if let Some(quotas) = quotas {
            let change = {
                let attempts = self.lock_attempts();
                if !attempts.is_current(attempt) {
                    log::trace!("[entitlement] Attempt {} superseded before its quotas", attempt.id);
                    return true;
                }
                self.quotas.store(quotas)
            };
            self.quotas.notify(change);
        }
        true
    }

    fn authenticated_alternate(&self) -> Option<&Arc<dyn AlternateIdentityBackend>> {
        self.alternate.as_ref().filter(|alt| alt.is_authenticated())
    }

    /// Publish the alternate backend's sign-in state without a lookup
    pub fn publish_alternate(&self, signed_in: bool) -> bool {
        let attempt = self.begin_attempt();
        let update = if signed_in {
            EntitlementUpdate::entitlement(alternate_entitlement())
        } else {
            EntitlementUpdate::tier(EntitlementTier::Unknown)
        };
        self.publish_if_current(&attempt, update, None)
    }

    /// Re-resolve after a session, provider or extension change
    pub async fn resolve(&self) -> ResolveOutcome {
        self.wait_for_sign_in().await;
        let attempt = self.begin_attempt();

        if self.authenticated_alternate().is_some() {
            log::info!("[entitlement] Alternate backend signed in, skipping session lookup");
            if !self.publish_if_current(
                &attempt,
                EntitlementUpdate::entitlement(alternate_entitlement()),
                None,
            ) {
                return ResolveOutcome::Superseded;
            }
            return ResolveOutcome::Alternate;
        }

        let sessions = self.identity.find_matching_sessions(&attempt.token).await;
        if attempt.token.is_cancelled() {
            return ResolveOutcome::Superseded;
        }

        let Some(sessions) = sessions else {
            // Resolve fresh once signed in again
            self.did_resolve.store(false, Ordering::SeqCst);
            if !self.publish_if_current(&attempt, EntitlementUpdate::tier(EntitlementTier::Unknown), None) {
                return ResolveOutcome::Superseded;
            }
            return ResolveOutcome::SignedOut;
        };

        // Signal the sign-in right away, but never downgrade a known tier
        if self.context.live_tier() == EntitlementTier::Unknown
            && !self.publish_if_current(
                &attempt,
                EntitlementUpdate::tier(EntitlementTier::Unresolved),
                None,
            )
        {
            return ResolveOutcome::Superseded;
        }

        if self.did_resolve.load(Ordering::SeqCst) {
            return ResolveOutcome::AlreadyResolved;
        }

        self.resolve_entitlement(&sessions, &attempt).await
    }

    /// Look up the entitlement even if it was resolved before.
    ///
    /// Without `sessions` the matching sessions are looked up first; when
    /// none exist nothing is published.
    pub async fn force_resolve(&self, sessions: Option<Vec<Session>>) -> Option<ResolvedEntitlement> {
        let attempt = self.begin_attempt();
        if self.authenticated_alternate().is_some() {
            log::debug!("[entitlement] force_resolve: alternate backend signed in, skipping");
            return None;
        }

        let sessions = match sessions {
            Some(sessions) => sessions,
            None => self.identity.find_matching_sessions(&attempt.token).await?,
        };
        if sessions.is_empty() {
            return None;
        }

        match self.resolve_entitlement(&sessions, &attempt).await {
            ResolveOutcome::Resolved(resolved) => Some(resolved),
            _ => None,
        }
    }

    async fn resolve_entitlement(&self, sessions: &[Session], attempt: &Attempt) -> ResolveOutcome {
        let Some(fetched) = self.fetch_entitlement(sessions, &attempt.token).await else {
            return ResolveOutcome::Superseded;
        };

        let resolved = fetched.resolved;
        if !self.publish_if_current(
            attempt,
            EntitlementUpdate::entitlement(resolved.entitlement.clone()),
            resolved.quotas.clone(),
        ) {
            return ResolveOutcome::Superseded;
        }
        if fetched.definitive {
            self.did_resolve.store(true, Ordering::SeqCst);
        }
        ResolveOutcome::Resolved(resolved)
    }

    /// One network round trip; `None` when cancelled
    async fn fetch_entitlement(
        &self,
        sessions: &[Session],
        token: &CancellationToken,
    ) -> Option<Fetched> {
        if token.is_cancelled() {
            return None;
        }

        let url = self.entitlement_url.as_str();
        let outcome = request_with_sessions(self.transport.as_ref(), sessions, token, |session| {
            HttpRequest::get(url, session.access_token.as_str())
        })
        .await;

        let unresolved = || Fetched {
            resolved: ResolvedEntitlement::tier(EntitlementTier::Unresolved),
            definitive: false,
        };

        let response = match outcome {
            SessionsOutcome::Cancelled => return None,
            SessionsOutcome::Success(response) => response,
            SessionsOutcome::Failed {
                last: Some(response),
                all_unusable: true,
            } => {
                // Expired/revoked tokens or missing scopes everywhere: signed out
                log::trace!("[entitlement] unexpected status code {}", response.status);
                return Some(Fetched {
                    resolved: ResolvedEntitlement::tier(EntitlementTier::Unknown),
                    definitive: false,
                });
            }
            SessionsOutcome::Failed { last: Some(response), .. } => {
                log::trace!("[entitlement] unexpected status code {}", response.status);
                return Some(unresolved());
            }
            SessionsOutcome::Failed { last: None, .. } => {
                log::trace!("[entitlement] no response");
                return Some(unresolved());
            }
        };

        if token.is_cancelled() {
            return None;
        }

        let Some(text) = response.text() else {
            log::trace!("[entitlement] response has no content");
            return Some(unresolved());
        };
        let Some(parsed) = EntitlementResponse::parse(text) else {
            return Some(unresolved());
        };

        let resolved = ResolvedEntitlement {
            entitlement: parsed.entitlement(),
            quotas: Some(parsed.quotas()),
        };
        log::debug!(
            "[entitlement] resolved to {} (tracking id: {})",
            resolved.entitlement.tier,
            parsed.analytics_tracking_id.as_deref().unwrap_or("-")
        );
        Some(Fetched {
            resolved,
            definitive: true,
        })
    }

    /// Interactive sign-in followed by a full lookup.
    ///
    /// With the alternate backend selected the primary provider is bypassed
    /// and `Free` is published without a network round trip.
    pub async fn sign_in(&self, options: SignInOptions) -> Result<SignInResult> {
        if options.use_alternate_backend {
            let alternate = self
                .alternate
                .as_ref()
                .ok_or_else(|| Error::auth("No alternate identity backend configured"))?;
            let session = alternate.sign_in().await?;
            log::info!("[entitlement] Signed in through the alternate backend");

            let entitlement = alternate_entitlement();
            let attempt = self.begin_attempt();
            self.publish_if_current(&attempt, EntitlementUpdate::entitlement(entitlement.clone()), None);
            return Ok(SignInResult {
                session,
                entitlement: Some(ResolvedEntitlement {
                    entitlement,
                    quotas: None,
                }),
            });
        }

        let _signing_in = self.begin_sign_in();
        let _suspended = self.context.suspend_guard();
        let session = self
            .identity
            .create_session(&options)
            .await
            .map_err(|e| Error::auth(format!("No session: {}", e)))?;
        let entitlement = self.force_resolve(Some(vec![session.clone()])).await;
        Ok(SignInResult {
            session,
            entitlement,
        })
    }

    /// Sign up for the free plan with the given sessions.
    ///
    /// Unknown failures ask the user whether to retry; a 422 rejection is
    /// shown verbatim and not retried.
    pub async fn sign_up_free(&self, sessions: &[Session]) -> SignUpOutcome {
        let body = SignUpRequest::new(self.telemetry_opt_out).body();
        let url = self.signup_url.as_str();
        let token = CancellationToken::new();
        let _suspended = self.context.suspend_guard();

        loop {
            let outcome = request_with_sessions(self.transport.as_ref(), sessions, &token, |session| {
                HttpRequest::post(url, session.access_token.as_str(), body.clone())
            })
            .await;

            let response = match outcome {
                SessionsOutcome::Success(response) => response,
                SessionsOutcome::Failed {
                    last: Some(response),
                    ..
                } => {
                    if response.status == 422 {
                        if let Some(message) = response.text().and_then(SignUpRejection::parse_message) {
                            log::error!("[entitlement] sign-up: unprocessable entity ({})", message);
                            if !self.shutting_down.load(Ordering::SeqCst) {
                                self.dialogs.show_error(SIGN_UP_REJECTED_MESSAGE, &message).await;
                            }
                            return SignUpOutcome::Failed { code: 422 };
                        }
                    }
                    let detail = format!("Unexpected status code {}.", response.status);
                    let log_message =
                        format!("[entitlement] sign-up: unexpected status code {}", response.status);
                    if self.retry_after_error(&detail, &log_message).await {
                        continue;
                    }
                    return SignUpOutcome::Failed {
                        code: response.status,
                    };
                }
                SessionsOutcome::Failed { last: None, .. } | SessionsOutcome::Cancelled => {
                    if self
                        .retry_after_error("No response received.", "[entitlement] sign-up: no response")
                        .await
                    {
                        continue;
                    }
                    return SignUpOutcome::Failed { code: 1 };
                }
            };

            let Some(text) = response.text() else {
                if self
                    .retry_after_error(
                        "Response has no contents.",
                        "[entitlement] sign-up: response has no content",
                    )
                    .await
                {
                    continue;
                }
                return SignUpOutcome::Failed { code: 2 };
            };

            let parsed: SignUpResponse = match serde_json::from_str(text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let log_message = format!("[entitlement] sign-up: error parsing response ({})", e);
                    if self
                        .retry_after_error("Invalid response contents.", &log_message)
                        .await
                    {
                        continue;
                    }
                    return SignUpOutcome::Failed { code: 3 };
                }
            };

            // The endpoint fails in every other case, so the user is signed up now
            log::trace!("[entitlement] sign-up: response is {}", text);
            let attempt = self.begin_attempt();
            self.publish_if_current(&attempt, EntitlementUpdate::tier(EntitlementTier::Free), None);
            return SignUpOutcome::Success {
                subscribed: parsed.subscribed,
            };
        }
    }

    async fn retry_after_error(&self, detail: &str, log_message: &str) -> bool {
        log::error!("{}", log_message);
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        self.dialogs.confirm_retry(SIGN_UP_ERROR_MESSAGE, detail).await
    }

    /// Fetch quotas from the alternate backend's usage endpoint and accept them
    pub async fn fetch_alternate_quotas(&self) -> Result<Option<Quotas>> {
        let Some(alternate) = &self.alternate else {
            return Ok(None);
        };
        let Some(token) = alternate.session_token() else {
            log::warn!("[entitlement] No alternate session token available");
            return Ok(None);
        };

        log::info!("[entitlement] Fetching quotas from the usage endpoint");
        let usage: UsageResponse = get_json(self.transport.as_ref(), &self.usage_url, &token).await?;
        match usage.quotas {
            Some(quotas) => {
                self.quotas.accept(quotas.clone());
                Ok(Some(quotas))
            }
            None => Ok(None),
        }
    }
}

impl Drop for EntitlementRequests {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for EntitlementRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementRequests")
            .field("entitlement_url", &self.entitlement_url)
            .field("identity", &self.identity)
            .field("did_resolve", &self.did_resolve.load(Ordering::SeqCst))
            .finish()
    }
}

/// Entitlement granted by the alternate backend
pub fn alternate_entitlement() -> Entitlement {
    Entitlement::new(EntitlementTier::Free).with_sku(Some(ALTERNATE_FREE_SKU.to_string()))
}
