//! Zero-argument change notifications
//!
//! Every event exposed by this crate is a bare "something changed" signal.
//! Subscribers re-read whatever state they care about instead of receiving
//! a payload, so a late subscriber never observes a stale value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Callback invoked when an event fires
pub type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl Listeners {
    fn entries(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        // Listeners never run under this lock, so the list is intact
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A typed, zero-argument event source
#[derive(Clone, Default)]
pub struct Emitter {
    inner: Arc<Listeners>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the returned [`Subscription`] removes it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries().push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.inner),
        }
    }

    /// Notify all current listeners.
    ///
    /// Listeners run outside the registration lock so they may subscribe,
    /// unsubscribe or fire other events.
    pub fn fire(&self) {
        let snapshot: Vec<Listener> = self
            .inner
            .entries()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener();
        }
    }

    /// Number of live subscriptions
    pub fn listener_count(&self) -> usize {
        self.inner.entries().len()
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Disposer returned by [`Emitter::subscribe`]
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Explicitly unsubscribe (same as dropping)
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.entries().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fire_reaches_all_listeners() {
        let emitter = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let _s1 = emitter.subscribe(move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        let _s2 = emitter.subscribe(move || {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        emitter.fire();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let emitter = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let sub = emitter.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        emitter.fire();
        sub.dispose();
        emitter.fire();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_fire_another_emitter() {
        let first = Emitter::new();
        let second = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let _s2 = second.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let forward = second.clone();
        let _s1 = first.subscribe(move || forward.fire());

        first.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_after_poisoned_lock() {
        let emitter = Emitter::new();
        let inner = Arc::clone(&emitter.inner);
        let _ = std::thread::spawn(move || {
            let _entries = inner.entries.lock().unwrap();
            panic!("poison the listener list");
        })
        .join();
        assert!(emitter.inner.entries.is_poisoned());

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = emitter.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        emitter.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(emitter.listener_count(), 0);
    }
}
