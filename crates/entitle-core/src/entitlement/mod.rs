//! Entitlement module

pub mod context;
pub mod http;
pub mod identity;
pub mod readiness;
pub mod requests;
pub mod response;
pub mod service;
pub mod storage;
pub mod types;

pub use context::{ContextPublisher, PublisherSettings, SuspendGuard};
pub use http::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
pub use identity::{
    Account, AlternateIdentityBackend, AuthenticationService, IdentityResolver, Session,
    SignInOptions,
};
pub use readiness::{LogReporter, Readiness, ReadinessReporter, ReadinessWatchdog};
pub use requests::{
    alternate_entitlement, DialogService, EntitlementRequests, NoDialogs, ResolveOutcome,
    ResolvedEntitlement, SignInResult, SignUpOutcome, ALTERNATE_FREE_SKU,
};
pub use response::{EntitlementResponse, LIMITED_FREE_SKU};
pub use service::{ChatEntitlementService, ChatEntitlementServiceBuilder};
pub use storage::{FileStateStore, MemoryStateStore, StateStore};
pub use types::{
    is_anonymous, ContextFlags, ContextValue, Entitlement, EntitlementState, EntitlementTier,
    EntitlementUpdate, Sentiment,
};
