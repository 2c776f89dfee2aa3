//! Context publisher
//!
//! Owns the single [`EntitlementState`] and the flags derived from it.
//! Every mutation goes through [`ContextPublisher::update`]; observers read
//! [`ContextPublisher::flags`] and subscribe to zero-argument change events.
//!
//! A suspend/resume barrier lets a multi-step transition (sign in, then
//! learn the entitlement) publish once at the end instead of once per step.
//! Suspension nests: flags are only published when the outermost
//! suspension is lifted.

use std::sync::{Arc, Mutex, MutexGuard};

use super::storage::{read_object, write_object, StateStore, SETUP_CONTEXT_KEY};
use super::types::{is_anonymous, ContextFlags, EntitlementState, EntitlementUpdate};
use crate::events::Emitter;

/// Configuration inputs the published flags depend on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherSettings {
    /// Signed-out users may use the feature anonymously
    pub allow_anonymous: bool,
    /// Forces `hidden=true` regardless of stored state
    pub disable_ai_features: bool,
    /// Organisations whose members count as internal
    pub internal_organisations: Vec<String>,
}

impl From<&crate::config::EntitlementConfig> for PublisherSettings {
    fn from(config: &crate::config::EntitlementConfig) -> Self {
        Self {
            allow_anonymous: config.allow_anonymous_access,
            disable_ai_features: config.disable_ai_features,
            internal_organisations: config.internal_organisations.clone(),
        }
    }
}

struct Inner {
    state: EntitlementState,
    /// State captured when the outermost suspension began
    suspended_state: Option<EntitlementState>,
    suspend_depth: usize,
    /// A change happened while suspended
    pending: bool,
    published: ContextFlags,
    settings: PublisherSettings,
}

/// Which events a publish has to fire, computed under the lock
#[derive(Default)]
struct Notification {
    changed: bool,
    entitlement: bool,
    sentiment: bool,
    anonymous: bool,
}

/// Single writer of the entitlement state
pub struct ContextPublisher {
    store: Arc<dyn StateStore>,
    inner: Mutex<Inner>,
    on_did_change: Emitter,
    on_did_change_entitlement: Emitter,
    on_did_change_sentiment: Emitter,
    on_did_change_anonymous: Emitter,
}

impl ContextPublisher {
    /// Load the persisted state (default `Unknown`) and publish it
    pub fn new(store: Arc<dyn StateStore>, settings: PublisherSettings) -> Self {
        let state: EntitlementState =
            read_object(store.as_ref(), SETUP_CONTEXT_KEY).unwrap_or_default();
        log::debug!(
            "[entitlement:context] Loaded persisted state: tier={} installed={} hidden={}",
            state.tier,
            state.sentiment.installed,
            state.sentiment.hidden
        );

        let published = derive_flags(&state, &settings);
        Self {
            store,
            inner: Mutex::new(Inner {
                state,
                suspended_state: None,
                suspend_depth: 0,
                pending: false,
                published,
                settings,
            }),
            on_did_change: Emitter::new(),
            on_did_change_entitlement: Emitter::new(),
            on_did_change_sentiment: Emitter::new(),
            on_did_change_anonymous: Emitter::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking listener never runs under this lock, so the data is intact
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state as collaborators should see it.
    ///
    /// During suspension this is the pre-suspend state. The disable-AI
    /// setting always wins over the stored `hidden` flag.
    pub fn state(&self) -> EntitlementState {
        let inner = self.lock();
        let state = inner.suspended_state.as_ref().unwrap_or(&inner.state);
        with_configuration(state, &inner.settings)
    }

    /// Tier including changes not yet published by a suspension
    pub(crate) fn live_tier(&self) -> super::types::EntitlementTier {
        self.lock().state.tier
    }

    /// Most recently published flags
    pub fn flags(&self) -> ContextFlags {
        self.lock().published.clone()
    }

    pub fn settings(&self) -> PublisherSettings {
        self.lock().settings.clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspend_depth > 0
    }

    /// Fires after every publish
    pub fn on_did_change(&self) -> &Emitter {
        &self.on_did_change
    }

    /// Fires when a tier, organisation or sku slot changed
    pub fn on_did_change_entitlement(&self) -> &Emitter {
        &self.on_did_change_entitlement
    }

    /// Fires when a sentiment slot changed
    pub fn on_did_change_sentiment(&self) -> &Emitter {
        &self.on_did_change_sentiment
    }

    /// Fires when the `anonymous` slot flipped
    pub fn on_did_change_anonymous(&self) -> &Emitter {
        &self.on_did_change_anonymous
    }

    /// Apply the defined fields of `update`.
    ///
    /// Returns whether the state changed. Identical results neither persist
    /// nor notify. Persistence failures are logged and otherwise ignored.
    pub fn update(&self, update: EntitlementUpdate) -> bool {
        log::trace!("[entitlement:context] update(): {:?}", update);

        let notification = {
            let mut inner = self.lock();
            let before = inner.state.clone();
            let mut hidden = update.hidden;

            if let (Some(installed), Some(disabled)) = (update.installed, update.disabled) {
                inner.state.sentiment.installed = installed;
                inner.state.sentiment.disabled = disabled;
                if let Some(untrusted) = update.untrusted {
                    inner.state.sentiment.untrusted = untrusted;
                }
                if installed && !disabled {
                    // Usable again, so surface it even if it was hidden
                    hidden = Some(false);
                }
            } else {
                if let Some(installed) = update.installed {
                    inner.state.sentiment.installed = installed;
                }
                if let Some(disabled) = update.disabled {
                    inner.state.sentiment.disabled = disabled;
                }
                if let Some(untrusted) = update.untrusted {
                    inner.state.sentiment.untrusted = untrusted;
                }
            }

            if let Some(hidden) = hidden {
                inner.state.sentiment.hidden = hidden;
            }
            if let Some(later) = update.later {
                inner.state.sentiment.later = later;
            }

            if let Some(entitlement) = update.entitlement {
                inner.state.tier = entitlement.tier;
                inner.state.organisations = entitlement.organisations;
                inner.state.sku = entitlement.sku;

                if entitlement.tier.is_registered() {
                    inner.state.sentiment.registered = true;
                } else if entitlement.tier == super::types::EntitlementTier::Available {
                    // Only a user who can still sign up loses the flag
                    inner.state.sentiment.registered = false;
                }
            }

            if inner.state == before {
                log::trace!("[entitlement:context] State unchanged, skipping publish");
                return false;
            }

            if inner.state.persisted() != before.persisted() {
                if let Err(e) = write_object(
                    self.store.as_ref(),
                    SETUP_CONTEXT_KEY,
                    &inner.state.persisted(),
                ) {
                    log::warn!("[entitlement:context] Failed to persist state: {}", e);
                }
            }

            if inner.suspend_depth > 0 {
                inner.pending = true;
                None
            } else {
                Some(publish_locked(&mut inner))
            }
        };

        if let Some(notification) = notification {
            self.fire(notification);
        }
        true
    }

    /// Replace the configuration inputs and republish if anything derived changed
    pub fn update_settings(&self, settings: PublisherSettings) {
        let notification = {
            let mut inner = self.lock();
            if inner.settings == settings {
                return;
            }
            inner.settings = settings;
            if inner.suspend_depth > 0 {
                inner.pending = true;
                None
            } else {
                Some(publish_locked(&mut inner))
            }
        };
        if let Some(notification) = notification {
            self.fire(notification);
        }
    }

    /// Defer publication until the matching [`resume`](Self::resume)
    pub fn suspend(&self) {
        let mut inner = self.lock();
        if inner.suspend_depth == 0 {
            inner.suspended_state = Some(inner.state.clone());
        }
        inner.suspend_depth += 1;
        log::trace!("[entitlement:context] suspend (depth {})", inner.suspend_depth);
    }

    /// Lift one level of suspension; the outermost resume publishes once
    pub fn resume(&self) {
        let notification = {
            let mut inner = self.lock();
            if inner.suspend_depth == 0 {
                log::warn!("[entitlement:context] resume() without matching suspend()");
                return;
            }
            inner.suspend_depth -= 1;
            log::trace!("[entitlement:context] resume (depth {})", inner.suspend_depth);
            if inner.suspend_depth > 0 {
                return;
            }
            inner.suspended_state = None;
            if !inner.pending {
                return;
            }
            publish_locked(&mut inner)
        };
        self.fire(notification);
    }

    /// Suspend until the returned guard is dropped
    pub fn suspend_guard(&self) -> SuspendGuard<'_> {
        self.suspend();
        SuspendGuard { publisher: self }
    }

    fn fire(&self, notification: Notification) {
        if notification.entitlement {
            self.on_did_change_entitlement.fire();
        }
        if notification.sentiment {
            self.on_did_change_sentiment.fire();
        }
        if notification.anonymous {
            self.on_did_change_anonymous.fire();
        }
        if notification.changed {
            self.on_did_change.fire();
        }
    }
}

impl std::fmt::Debug for ContextPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ContextPublisher")
            .field("state", &inner.state)
            .field("suspend_depth", &inner.suspend_depth)
            .finish()
    }
}

/// Keeps the publisher suspended while alive
#[must_use = "the publisher resumes as soon as the guard is dropped"]
pub struct SuspendGuard<'a> {
    publisher: &'a ContextPublisher,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.publisher.resume();
    }
}

fn with_configuration(state: &EntitlementState, settings: &PublisherSettings) -> EntitlementState {
    let mut state = state.clone();
    if settings.disable_ai_features {
        state.sentiment.hidden = true;
    }
    state
}

fn derive_flags(state: &EntitlementState, settings: &PublisherSettings) -> ContextFlags {
    let state = with_configuration(state, settings);
    let sentiment = &state.sentiment;
    let internal = state
        .organisations
        .as_ref()
        .map(|orgs| {
            orgs.iter()
                .any(|org| settings.internal_organisations.iter().any(|i| i == org))
        })
        .unwrap_or(false);

    ContextFlags {
        tier: state.tier,
        signed_out: state.tier == super::types::EntitlementTier::Unknown,
        can_sign_up: state.tier == super::types::EntitlementTier::Available,
        hidden: sentiment.hidden,
        disabled: sentiment.disabled,
        untrusted: sentiment.untrusted,
        installed: sentiment.installed,
        later: sentiment.later,
        registered: sentiment.registered,
        organisations: state.organisations.clone(),
        internal,
        sku: state.sku.clone(),
        anonymous: is_anonymous(settings.allow_anonymous, state.tier, sentiment),
    }
}

fn publish_locked(inner: &mut Inner) -> Notification {
    let flags = derive_flags(&inner.state, &inner.settings);
    let previous = std::mem::replace(&mut inner.published, flags);
    inner.pending = false;

    let published = &inner.published;
    log::trace!("[entitlement:context] publish: {:?}", published);
    Notification {
        changed: *published != previous,
        entitlement: published.entitlement_differs(&previous),
        sentiment: published.sentiment_differs(&previous),
        anonymous: published.anonymous != previous.anonymous,
    }
}
