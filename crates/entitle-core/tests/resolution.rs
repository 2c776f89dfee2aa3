//! End-to-end entitlement resolution through ChatEntitlementService

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{harness, harness_with, session, settle, FakeAlternate};
use entitle_core::entitlement::{ALTERNATE_FREE_SKU, LIMITED_FREE_SKU};
use entitle_core::{
    EntitlementConfig, EntitlementTier, QuotaKind, Readiness, ResolveOutcome, SignInOptions,
};

const BUSINESS: &str = r#"{"copilot_plan": "business", "organization_login_list": ["acme"]}"#;

#[tokio::test]
async fn test_signed_out_publishes_unknown() {
    let h = harness(vec![]);
    let outcome = h.service.resolve().await;

    assert_eq!(outcome, ResolveOutcome::SignedOut);
    assert_eq!(h.service.tier(), EntitlementTier::Unknown);
    assert!(h.service.flags().signed_out);
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn test_signed_out_anonymous_when_allowed() {
    let config = EntitlementConfig {
        allow_anonymous_access: true,
        ..Default::default()
    };
    let h = harness_with(config, vec![], None);
    h.service.resolve().await;
    assert!(h.service.anonymous());
}

#[tokio::test]
async fn test_falls_through_unusable_session() {
    let h = harness(vec![session("s1", "expired"), session("s2", "good")]);
    h.transport.respond("expired", 401, "");
    h.transport.respond("good", 200, BUSINESS);

    let outcome = h.service.resolve().await;

    assert!(matches!(outcome, ResolveOutcome::Resolved(_)));
    assert_eq!(h.service.tier(), EntitlementTier::Business);
    assert_eq!(h.service.organisations(), Some(vec!["acme".to_string()]));
    assert!(h.service.flags().registered);
    assert_eq!(h.transport.request_count(), 2);
}

#[tokio::test]
async fn test_all_sessions_unusable_is_unknown() {
    let h = harness(vec![session("s1", "a"), session("s2", "b")]);
    h.transport.respond("a", 401, "");
    h.transport.respond("b", 404, "");

    h.service.resolve().await;
    assert_eq!(h.service.tier(), EntitlementTier::Unknown);
}

#[tokio::test]
async fn test_network_failure_is_unresolved() {
    // No scripted response: the transport errors
    let h = harness(vec![session("s1", "offline")]);
    h.service.resolve().await;
    assert_eq!(h.service.tier(), EntitlementTier::Unresolved);
}

#[tokio::test]
async fn test_newest_attempt_wins() {
    let h = harness(vec![session("old", "slow")]);
    h.transport
        .respond_after("slow", Duration::from_millis(150), 200, BUSINESS);
    h.transport
        .respond("fast", 200, &format!(r#"{{"access_type_sku": "{}"}}"#, LIMITED_FREE_SKU));

    let first = {
        let service = h.service.clone();
        tokio::spawn(async move { service.resolve().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Sessions change while the first lookup is still in flight
    h.auth.set_sessions(vec![session("new", "fast")]);
    settle().await;

    assert_eq!(first.await.unwrap(), ResolveOutcome::Superseded);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.service.tier(), EntitlementTier::Free);
    assert_eq!(h.service.sku().as_deref(), Some(LIMITED_FREE_SKU));
}

#[tokio::test]
async fn test_resolved_once_skips_network() {
    let h = harness(vec![session("s1", "t")]);
    h.transport.respond("t", 200, BUSINESS);

    h.service.resolve().await;
    assert_eq!(h.service.resolve().await, ResolveOutcome::AlreadyResolved);
    assert_eq!(h.transport.request_count(), 1);

    // Signing out resets the latch
    h.auth.set_sessions(vec![]);
    settle().await;
    assert_eq!(h.service.tier(), EntitlementTier::Unknown);

    h.auth.set_sessions(vec![session("s1", "t")]);
    settle().await;
    assert_eq!(h.service.tier(), EntitlementTier::Business);
    assert_eq!(h.transport.request_count(), 2);
}

#[tokio::test]
async fn test_entitlement_event_fires_once_per_change() {
    let h = harness(vec![session("s1", "t")]);
    h.transport.respond("t", 200, BUSINESS);

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let _sub = h.service.on_did_change_entitlement().subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.service.resolve().await;
    // Unknown -> Unresolved -> Business
    assert_eq!(count.load(Ordering::SeqCst), 2);

    h.service.force_resolve().await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_quotas_follow_entitlement() {
    let h = harness(vec![session("s1", "t")]);
    h.service.extension_state_changed(true, false, false);
    h.transport.respond(
        "t",
        200,
        r#"{
            "access_type_sku": "free_limited_copilot",
            "quota_reset_date_utc": "2026-11-01T00:00:00Z",
            "quota_snapshots": {
                "chat": {"entitlement": 50, "remaining": 0, "percent_remaining": 0},
                "completions": {"entitlement": 2000, "remaining": 1500, "percent_remaining": 75}
            }
        }"#,
    );

    h.service.resolve().await;

    let quotas = h.service.quotas();
    assert_eq!(quotas.get(QuotaKind::Completions).unwrap().remaining, 1500.0);
    assert!(quotas.reset_date_has_time);
    assert!(h.service.quota_flags().chat_quota_exceeded);
    assert!(!h.service.quota_flags().completions_quota_exceeded);

    // An exhausted quota is reported, not looked up again
    settle().await;
    assert_eq!(h.transport.request_count(), 1);
}

#[tokio::test]
async fn test_quotas_cleared_when_uninstalled() {
    let h = harness(vec![session("s1", "t")]);
    h.service.extension_state_changed(true, false, false);
    h.transport.respond(
        "t",
        200,
        r#"{"copilot_plan": "individual", "quota_snapshots": {"chat": {"entitlement": 10, "remaining": 5, "percent_remaining": 50}}}"#,
    );
    h.service.resolve().await;
    assert!(!h.service.quotas().is_empty());

    h.service.extension_state_changed(false, false, false);
    assert!(h.service.quotas().is_empty());
}

#[tokio::test]
async fn test_start_reports_ready() {
    let h = harness(vec![session("s1", "t")]);
    h.transport.respond("t", 200, BUSINESS);

    let readiness = h.service.start().await;
    assert!(matches!(readiness, Readiness::Ready(ResolveOutcome::Resolved(_))));
}

#[tokio::test]
async fn test_sign_in_resolves_with_new_session() {
    let h = harness(vec![]);
    h.auth.will_create(session("created", "fresh"));
    h.transport.respond("fresh", 200, r#"{"copilot_plan": "enterprise"}"#);

    let result = h.service.sign_in(SignInOptions::default()).await.unwrap();

    assert_eq!(result.session.id, "created");
    assert_eq!(
        result.entitlement.map(|e| e.entitlement.tier),
        Some(EntitlementTier::Enterprise)
    );
    assert_eq!(h.service.tier(), EntitlementTier::Enterprise);
}

#[tokio::test]
async fn test_sign_in_keeps_its_lookup_when_sessions_change() {
    let h = harness(vec![]);
    h.auth.will_create(session("created", "fresh"));
    h.transport.respond_after(
        "fresh",
        Duration::from_millis(30),
        200,
        r#"{"copilot_plan": "enterprise"}"#,
    );

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let _sub = h.service.on_did_change_entitlement().subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let result = h.service.sign_in(SignInOptions::default()).await.unwrap();
    assert_eq!(
        result.entitlement.map(|e| e.entitlement.tier),
        Some(EntitlementTier::Enterprise)
    );

    settle().await;
    assert_eq!(h.service.tier(), EntitlementTier::Enterprise);
    // Unknown -> Enterprise, published once at the end of the sign-in
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.request_count(), 1);
}

#[test]
fn test_entitlement_listener_may_shut_down_synchronously() {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let h = harness(vec![session("s1", "t")]);
            h.transport.respond("t", 200, BUSINESS);

            let service = Arc::downgrade(&h.service);
            let _sub = h.service.on_did_change_entitlement().subscribe(move || {
                if let Some(service) = service.upgrade() {
                    service.shutdown();
                }
            });

            let outcome = h.service.resolve().await;
            tx.send((outcome, h.service.tier())).unwrap();
        });
    });

    let (outcome, tier) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("resolve returns while a listener shuts the service down");
    // The optimistic publish fired the listener, which cancelled the lookup
    assert_eq!(outcome, ResolveOutcome::Superseded);
    assert_eq!(tier, EntitlementTier::Unresolved);
}

#[tokio::test]
async fn test_sign_in_declined_leaves_state() {
    let h = harness(vec![]);
    assert!(h.service.sign_in(SignInOptions::default()).await.is_err());
    assert_eq!(h.service.tier(), EntitlementTier::Unknown);
}

#[tokio::test]
async fn test_alternate_backend_short_circuits() {
    let alternate = FakeAlternate::new(true);
    let h = harness_with(
        EntitlementConfig::default(),
        vec![session("s1", "t")],
        Some(alternate.clone()),
    );

    assert_eq!(h.service.resolve().await, ResolveOutcome::Alternate);
    assert_eq!(h.service.tier(), EntitlementTier::Free);
    assert_eq!(h.service.sku().as_deref(), Some(ALTERNATE_FREE_SKU));
    assert_eq!(h.transport.request_count(), 0);

    alternate.set_authenticated(false);
    assert_eq!(h.service.tier(), EntitlementTier::Unknown);
}

#[tokio::test]
async fn test_alternate_sign_in_fetches_usage_quotas() {
    let alternate = FakeAlternate::new(false);
    let h = harness_with(EntitlementConfig::default(), vec![], Some(alternate.clone()));
    h.service.extension_state_changed(true, false, false);
    h.transport.respond(
        "alt-token",
        200,
        r#"{"quotas": {"chat": {"total": 100, "remaining": 40, "percentRemaining": 40}}}"#,
    );

    alternate.set_authenticated(true);
    settle().await;

    assert_eq!(h.service.tier(), EntitlementTier::Free);
    assert_eq!(h.service.quotas().get(QuotaKind::Chat).unwrap().remaining, 40.0);
}

#[tokio::test]
async fn test_alternate_sign_in_through_service() {
    let alternate = FakeAlternate::new(false);
    let h = harness_with(EntitlementConfig::default(), vec![], Some(alternate));

    let result = h
        .service
        .sign_in(SignInOptions {
            use_alternate_backend: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(result.session.id, "alt");
    assert_eq!(h.service.tier(), EntitlementTier::Free);
    assert_eq!(h.transport.request_count(), 0);
}
