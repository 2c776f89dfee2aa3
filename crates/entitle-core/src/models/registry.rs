//! Per-vendor model registry
//!
//! Vendors register a [`ModelProvider`]; the registry caches each vendor's
//! models separately and serializes resolution per vendor: concurrent
//! callers for the same vendor share one in-flight future, while different
//! vendors resolve independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};

use super::types::{model_identifier, ModelError, ModelInfo, ModelProvider, Vendor};
use crate::entitlement::storage::{read_object, write_object, StateStore, MODEL_PREFERENCES_KEY};
use crate::entitlement::ContextPublisher;
use crate::events::Emitter;

type ResolveFuture = Shared<BoxFuture<'static, Result<Vec<ModelInfo>, ModelError>>>;

struct VendorEntry {
    vendor: Vendor,
    provider: Arc<dyn ModelProvider>,
    generation: u64,
}

struct InFlight {
    id: u64,
    future: ResolveFuture,
}

struct Inner {
    vendors: Mutex<HashMap<String, VendorEntry>>,
    cache: Mutex<HashMap<String, Vec<ModelInfo>>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    /// Per-model visibility overrides keyed by `vendor/id`
    preferences: Mutex<HashMap<String, bool>>,
    next_id: AtomicU64,
    show_all: AtomicBool,
    store: Arc<dyn StateStore>,
    on_did_change_models: Emitter,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of model vendors, gated by the published entitlement flags
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Inner>,
    context: Arc<ContextPublisher>,
}

impl ModelRegistry {
    pub fn new(context: Arc<ContextPublisher>, store: Arc<dyn StateStore>, show_all: bool) -> Self {
        let preferences: HashMap<String, bool> =
            read_object(store.as_ref(), MODEL_PREFERENCES_KEY).unwrap_or_default();
        log::debug!("[models] Loaded {} visibility override(s)", preferences.len());

        Self {
            inner: Arc::new(Inner {
                vendors: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                preferences: Mutex::new(preferences),
                next_id: AtomicU64::new(1),
                show_all: AtomicBool::new(show_all),
                store,
                on_did_change_models: Emitter::new(),
            }),
            context,
        }
    }

    /// Fires when a vendor's models or a visibility override change
    pub fn on_did_change_models(&self) -> &Emitter {
        &self.inner.on_did_change_models
    }

    pub fn register_vendor(
        &self,
        vendor: Vendor,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<(), ModelError> {
        let mut vendors = lock(&self.inner.vendors);
        if vendors.contains_key(&vendor.id) {
            return Err(ModelError::AlreadyRegistered(vendor.id));
        }
        log::info!("[models] Registered vendor {}", vendor.id);
        let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        vendors.insert(
            vendor.id.clone(),
            VendorEntry {
                vendor,
                provider,
                generation,
            },
        );
        Ok(())
    }

    /// Remove a vendor and only that vendor's cached models
    pub fn unregister_vendor(&self, vendor_id: &str) -> bool {
        let removed = lock(&self.inner.vendors).remove(vendor_id).is_some();
        lock(&self.inner.in_flight).remove(vendor_id);
        let had_models = lock(&self.inner.cache).remove(vendor_id).is_some();

        if removed {
            log::info!("[models] Unregistered vendor {}", vendor_id);
        }
        if had_models {
            self.inner.on_did_change_models.fire();
        }
        removed
    }

    /// Vendors whose visibility condition holds for the current flags
    pub fn vendors(&self) -> Vec<Vendor> {
        let flags = self.context.flags();
        let mut visible: Vec<Vendor> = lock(&self.inner.vendors)
            .values()
            .filter(|entry| entry.vendor.when.evaluate(&flags))
            .map(|entry| entry.vendor.clone())
            .collect();
        visible.sort_by(|a, b| a.id.cmp(&b.id));
        visible
    }

    /// Resolve a vendor's models.
    ///
    /// While a resolution for `vendor_id` is in flight, further callers
    /// await that same result, whatever `allow_prompting` they passed.
    pub async fn resolve(
        &self,
        vendor_id: &str,
        allow_prompting: bool,
    ) -> Result<Vec<ModelInfo>, ModelError> {
        let future = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(vendor_id) {
                Some(existing) => {
                    log::trace!("[models] Joining in-flight resolution for {}", vendor_id);
                    existing.future.clone()
                }
                None => {
                    let (provider, generation, when) = {
                        let vendors = lock(&self.inner.vendors);
                        let entry = vendors
                            .get(vendor_id)
                            .ok_or_else(|| ModelError::VendorNotRegistered(vendor_id.to_string()))?;
                        (Arc::clone(&entry.provider), entry.generation, entry.vendor.when.clone())
                    };
                    if !when.evaluate(&self.context.flags()) {
                        return Err(ModelError::VendorUnavailable(vendor_id.to_string()));
                    }

                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = run_resolution(
                        Arc::clone(&self.inner),
                        vendor_id.to_string(),
                        provider,
                        generation,
                        id,
                        allow_prompting,
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(
                        vendor_id.to_string(),
                        InFlight {
                            id,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    /// Cached models of a vendor with visibility overrides applied
    pub fn models(&self, vendor_id: &str) -> Vec<ModelInfo> {
        let cached = lock(&self.inner.cache).get(vendor_id).cloned().unwrap_or_default();
        cached.into_iter().map(|m| self.apply_visibility(m)).collect()
    }

    /// Every cached `vendor/id`
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.cache)
            .values()
            .flatten()
            .map(|m| m.identifier())
            .collect();
        ids.sort();
        ids
    }

    /// Look up a model by `vendor/id`
    pub fn lookup(&self, identifier: &str) -> Option<ModelInfo> {
        let (vendor, id) = identifier.split_once('/')?;
        let model = lock(&self.inner.cache)
            .get(vendor)?
            .iter()
            .find(|m| m.id == id)
            .cloned()?;
        Some(self.apply_visibility(model))
    }

    fn apply_visibility(&self, mut model: ModelInfo) -> ModelInfo {
        if self.inner.show_all.load(Ordering::SeqCst) {
            model.is_user_selectable = true;
            return model;
        }
        let identifier = model_identifier(&model.vendor, &model.id);
        if let Some(visible) = lock(&self.inner.preferences).get(&identifier) {
            model.is_user_selectable = *visible;
        }
        model
    }

    /// Persist a per-model visibility override
    pub fn set_model_visibility(&self, identifier: &str, visible: bool) {
        let snapshot = {
            let mut preferences = lock(&self.inner.preferences);
            if preferences.get(identifier) == Some(&visible) {
                return;
            }
            preferences.insert(identifier.to_string(), visible);
            preferences.clone()
        };

        if let Err(e) = write_object(self.inner.store.as_ref(), MODEL_PREFERENCES_KEY, &snapshot) {
            log::warn!("[models] Failed to persist model preferences: {}", e);
        }
        self.inner.on_did_change_models.fire();
    }

    /// Force every model visible regardless of overrides
    pub fn set_show_all_models(&self, show_all: bool) {
        if self.inner.show_all.swap(show_all, Ordering::SeqCst) != show_all {
            self.inner.on_did_change_models.fire();
        }
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let vendors: Vec<String> = lock(&self.inner.vendors).keys().cloned().collect();
        f.debug_struct("ModelRegistry").field("vendors", &vendors).finish()
    }
}

async fn run_resolution(
    inner: Arc<Inner>,
    vendor_id: String,
    provider: Arc<dyn ModelProvider>,
    generation: u64,
    id: u64,
    allow_prompting: bool,
) -> Result<Vec<ModelInfo>, ModelError> {
    log::debug!(
        "[models] Resolving {} (prompting: {})",
        vendor_id,
        allow_prompting
    );
    let result = provider.provide_models(allow_prompting).await;

    {
        let mut in_flight = lock(&inner.in_flight);
        if in_flight.get(&vendor_id).map(|f| f.id) == Some(id) {
            in_flight.remove(&vendor_id);
        }
    }

    let models = match result {
        Ok(models) => models,
        Err(e) => {
            log::warn!("[models] Resolving {} failed: {}", vendor_id, e);
            return Err(e);
        }
    };

    let still_registered = lock(&inner.vendors)
        .get(&vendor_id)
        .is_some_and(|entry| entry.generation == generation);
    if !still_registered {
        return Err(ModelError::Abandoned(vendor_id));
    }

    let mut models: Vec<ModelInfo> = models
        .into_iter()
        .map(|mut m| {
            m.vendor = vendor_id.clone();
            m
        })
        .collect();
    if !allow_prompting && models.iter().any(|m| m.is_user_selectable) {
        models.retain(|m| m.is_user_selectable);
    }

    let changed = {
        let mut cache = lock(&inner.cache);
        let previous = cache.insert(vendor_id.clone(), models.clone());
        previous.as_ref() != Some(&models)
    };
    log::debug!("[models] {} resolved {} model(s)", vendor_id, models.len());
    if changed {
        inner.on_did_change_models.fire();
    }

    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::storage::MemoryStateStore;
    use crate::entitlement::{EntitlementTier, EntitlementUpdate, PublisherSettings};
    use crate::models::VendorWhen;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct StaticProvider {
        models: Vec<ModelInfo>,
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl StaticProvider {
        fn new(models: Vec<ModelInfo>) -> Arc<Self> {
            Arc::new(Self {
                models,
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
                fail: false,
            })
        }

        fn slow(models: Vec<ModelInfo>, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                models,
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                fail,
            })
        }
    }

    #[async_trait]
    impl ModelProvider for StaticProvider {
        async fn provide_models(&self, _allow_prompting: bool) -> Result<Vec<ModelInfo>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ModelError::Provider("boom".to_string()));
            }
            Ok(self.models.clone())
        }
    }

    fn registry() -> (ModelRegistry, Arc<ContextPublisher>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let context = Arc::new(ContextPublisher::new(
            store.clone(),
            PublisherSettings::default(),
        ));
        (ModelRegistry::new(context.clone(), store.clone(), false), context, store)
    }

    fn models(vendor: &str) -> Vec<ModelInfo> {
        vec![
            ModelInfo::new(vendor, "big", "Big").selectable(true),
            ModelInfo::new(vendor, "hidden", "Hidden"),
        ]
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let (registry, _, _) = registry();
        let provider = StaticProvider::slow(models("x"), false);
        registry
            .register_vendor(Vendor::new("x", "X"), provider.clone())
            .unwrap();

        let (a, b) = tokio::join!(registry.resolve("x", true), registry.resolve("x", true));
        assert_eq!(a.unwrap().len(), 2);
        assert_eq!(b.unwrap().len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // A later call fetches again
        registry.resolve("x", true).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_vendor() {
        let (registry, _, _) = registry();
        registry
            .register_vendor(Vendor::new("x", "X"), StaticProvider::slow(vec![], true))
            .unwrap();
        registry
            .register_vendor(Vendor::new("y", "Y"), StaticProvider::new(models("y")))
            .unwrap();

        let (x, y) = tokio::join!(registry.resolve("x", true), registry.resolve("y", true));
        assert_eq!(x.unwrap_err(), ModelError::Provider("boom".to_string()));
        assert_eq!(y.unwrap().len(), 2);
        assert!(registry.lookup("y/big").is_some());
        assert!(registry.models("x").is_empty());
    }

    #[tokio::test]
    async fn test_silent_resolution_narrows_to_selectable() {
        let (registry, _, _) = registry();
        registry
            .register_vendor(Vendor::new("x", "X"), StaticProvider::new(models("x")))
            .unwrap();

        let silent = registry.resolve("x", false).await.unwrap();
        assert_eq!(silent.len(), 1);
        assert_eq!(silent[0].id, "big");
    }

    #[tokio::test]
    async fn test_unregister_clears_only_that_vendor() {
        let (registry, _, _) = registry();
        registry
            .register_vendor(Vendor::new("x", "X"), StaticProvider::new(models("x")))
            .unwrap();
        registry
            .register_vendor(Vendor::new("y", "Y"), StaticProvider::new(models("y")))
            .unwrap();
        registry.resolve("x", true).await.unwrap();
        registry.resolve("y", true).await.unwrap();

        assert!(registry.unregister_vendor("x"));
        assert!(registry.lookup("x/big").is_none());
        assert!(registry.lookup("y/big").is_some());
        assert_eq!(registry.identifiers(), vec!["y/big", "y/hidden"]);
    }

    #[tokio::test]
    async fn test_visibility_overrides_and_show_all() {
        let (registry, context, store) = registry();
        registry
            .register_vendor(Vendor::new("x", "X"), StaticProvider::new(models("x")))
            .unwrap();
        registry.resolve("x", true).await.unwrap();

        assert!(!registry.lookup("x/hidden").unwrap().is_user_selectable);
        registry.set_model_visibility("x/hidden", true);
        registry.set_model_visibility("x/big", false);
        assert!(registry.lookup("x/hidden").unwrap().is_user_selectable);
        assert!(!registry.lookup("x/big").unwrap().is_user_selectable);

        registry.set_show_all_models(true);
        assert!(registry.lookup("x/big").unwrap().is_user_selectable);

        // Overrides survive a new registry on the same store
        let reopened = ModelRegistry::new(context, store, false);
        reopened
            .register_vendor(Vendor::new("x", "X"), StaticProvider::new(models("x")))
            .unwrap();
        reopened.resolve("x", true).await.unwrap();
        assert!(reopened.lookup("x/hidden").unwrap().is_user_selectable);
    }

    #[tokio::test]
    async fn test_vendors_gated_by_context() {
        let (registry, context, _) = registry();
        registry
            .register_vendor(
                Vendor::new("paid", "Paid").with_when(VendorWhen::Registered),
                StaticProvider::new(models("paid")),
            )
            .unwrap();
        registry
            .register_vendor(Vendor::new("open", "Open"), StaticProvider::new(models("open")))
            .unwrap();

        let ids: Vec<_> = registry.vendors().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec!["open"]);
        assert_eq!(
            registry.resolve("paid", true).await.unwrap_err(),
            ModelError::VendorUnavailable("paid".to_string())
        );

        context.update(EntitlementUpdate::tier(EntitlementTier::Pro));
        let ids: Vec<_> = registry.vendors().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec!["open", "paid"]);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_vendor() {
        let (registry, _, _) = registry();
        registry
            .register_vendor(Vendor::new("x", "X"), StaticProvider::new(vec![]))
            .unwrap();
        assert_eq!(
            registry
                .register_vendor(Vendor::new("x", "X"), StaticProvider::new(vec![]))
                .unwrap_err(),
            ModelError::AlreadyRegistered("x".to_string())
        );
        assert_eq!(
            registry.resolve("nope", true).await.unwrap_err(),
            ModelError::VendorNotRegistered("nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_models_changed_event() {
        let (registry, _, _) = registry();
        registry
            .register_vendor(Vendor::new("x", "X"), StaticProvider::new(models("x")))
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = registry.on_did_change_models().subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        registry.resolve("x", true).await.unwrap();
        registry.resolve("x", true).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
