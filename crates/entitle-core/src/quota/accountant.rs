//! Quota change detection
//!
//! Keeps the last accepted [`Quotas`] and turns each new set into at most
//! two zero-argument events: "some quota crossed the exhausted boundary"
//! and "some remaining percentage moved".

use std::sync::Mutex;

use serde::Serialize;

use super::types::{QuotaKind, QuotaSnapshot, Quotas};
use crate::events::Emitter;

/// Quota flags published next to the entitlement flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaFlags {
    pub chat_quota_exceeded: bool,
    pub completions_quota_exceeded: bool,
}

/// What changed for one quota kind between two accepted sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaChange {
    pub exceeded: bool,
    pub remaining: bool,
}

/// Compare two optional snapshots of the same kind
pub fn compare(old: Option<&QuotaSnapshot>, new: Option<&QuotaSnapshot>) -> QuotaChange {
    let old_percent = old.map(|q| q.percent_remaining);
    let new_percent = new.map(|q| q.percent_remaining);
    QuotaChange {
        exceeded: (old_percent == Some(0.0)) != (new_percent == Some(0.0)),
        remaining: old_percent != new_percent,
    }
}

#[derive(Default)]
struct State {
    quotas: Quotas,
    flags: QuotaFlags,
}

/// Tracks the current quotas and fires OR-reduced change events
#[derive(Default)]
pub struct QuotaAccountant {
    state: Mutex<State>,
    on_did_change_quota_exceeded: Emitter,
    on_did_change_quota_remaining: Emitter,
}

impl QuotaAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current quotas with `quotas`
    pub fn accept(&self, quotas: Quotas) {
        let change = self.store(quotas);
        self.notify(change);
    }

    /// Replace the current quotas without firing; pair with [`notify`](Self::notify)
    pub(crate) fn store(&self, quotas: Quotas) -> QuotaChange {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let old = std::mem::replace(&mut state.quotas, quotas);

        state.flags = QuotaFlags {
            chat_quota_exceeded: state.quotas.chat.as_ref().is_some_and(|q| q.is_exceeded()),
            completions_quota_exceeded: state
                .quotas
                .completions
                .as_ref()
                .is_some_and(|q| q.is_exceeded()),
        };

        let mut any = QuotaChange::default();
        for kind in QuotaKind::ALL {
            let change = compare(old.get(kind), state.quotas.get(kind));
            if change.exceeded || change.remaining {
                log::debug!(
                    "[quota] {} changed (exceeded: {}, remaining: {})",
                    kind,
                    change.exceeded,
                    change.remaining
                );
            }
            any.exceeded |= change.exceeded;
            any.remaining |= change.remaining;
        }
        any
    }

    /// Fire the events for a change returned by [`store`](Self::store)
    pub(crate) fn notify(&self, change: QuotaChange) {
        if change.exceeded {
            self.on_did_change_quota_exceeded.fire();
        }
        if change.remaining {
            self.on_did_change_quota_remaining.fire();
        }
    }

    /// Forget every quota
    pub fn clear(&self) {
        self.accept(Quotas::default());
    }

    pub fn quotas(&self) -> Quotas {
        self.state
            .lock()
            .map(|s| s.quotas.clone())
            .unwrap_or_default()
    }

    pub fn flags(&self) -> QuotaFlags {
        self.state.lock().map(|s| s.flags).unwrap_or_default()
    }

    pub fn on_did_change_quota_exceeded(&self) -> &Emitter {
        &self.on_did_change_quota_exceeded
    }

    pub fn on_did_change_quota_remaining(&self) -> &Emitter {
        &self.on_did_change_quota_remaining
    }
}

impl std::fmt::Debug for QuotaAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaAccountant")
            .field("quotas", &self.quotas())
            .field("flags", &self.flags())
            .finish()
    }
}
