//! Bearer-authenticated HTTP transport
//!
//! The coordinator only needs "send this request with this token and give
//! me the status and body"; [`HttpTransport`] is that seam and
//! [`ReqwestTransport`] the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use super::identity::Session;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// One outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer_token: String,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            bearer_token: bearer_token.into(),
            body: None,
        }
    }

    pub fn post(
        url: impl Into<String>,
        bearer_token: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            bearer_token: bearer_token.into(),
            body: Some(body),
        }
    }
}

/// Status and raw body of a completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: Some(body.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// 401 (token expired/revoked) and 404 (missing scopes) mean this
    /// identity cannot be used, not that the service is unhealthy
    pub fn is_unusable_identity(&self) -> bool {
        self.status == 401 || self.status == 404
    }

    /// Body text, `None` when absent or blank
    pub fn text(&self) -> Option<&str> {
        self.body.as_deref().filter(|b| !b.trim().is_empty())
    }
}

/// Sends bearer-authenticated requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform the request. Non-200 statuses are returned, not raised.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpTransport`] backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("entitle/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        log::debug!("[entitlement:http] {} {}", request.method, request.url);

        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        let builder = builder
            .bearer_auth(&request.bearer_token)
            .header("Accept", "application/json")
            .header("Cache-Control", "no-cache");
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.ok();
        log::debug!("[entitlement:http] {} {} -> {}", request.method, request.url, status);

        Ok(HttpResponse { status, body })
    }
}

/// Result of trying a request against a list of sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionsOutcome {
    /// A session produced HTTP 200
    Success(HttpResponse),
    /// Every session failed; `last` is the final non-200 response seen
    Failed {
        last: Option<HttpResponse>,
        /// Every session answered 401/404
        all_unusable: bool,
    },
    Cancelled,
}

/// Run `send` against each session in order until one returns 200.
///
/// A 401/404 or transport error from one session moves on to the next.
pub async fn request_with_sessions(
    transport: &dyn HttpTransport,
    sessions: &[Session],
    token: &CancellationToken,
    build: impl Fn(&Session) -> HttpRequest,
) -> SessionsOutcome {
    let mut last = None;
    let mut all_unusable = !sessions.is_empty();

    for session in sessions {
        if token.is_cancelled() {
            return SessionsOutcome::Cancelled;
        }

        let request = build(session);
        let result = tokio::select! {
            _ = token.cancelled() => return SessionsOutcome::Cancelled,
            result = transport.send(request) => result,
        };

        match result {
            Ok(response) if response.is_ok() => return SessionsOutcome::Success(response),
            Ok(response) => {
                log::trace!(
                    "[entitlement] session {} got HTTP {}, trying next",
                    session.id,
                    response.status
                );
                all_unusable &= response.is_unusable_identity();
                last = Some(response);
            }
            Err(e) => {
                log::error!("[entitlement] request: error {}", e);
                all_unusable = false;
            }
        }
    }

    SessionsOutcome::Failed { last, all_unusable }
}

/// Fetch `url` with a bare token and decode a JSON body
pub async fn get_json<T: serde::de::DeserializeOwned>(
    transport: &dyn HttpTransport,
    url: &str,
    bearer_token: &str,
) -> Result<T> {
    let response = transport.send(HttpRequest::get(url, bearer_token)).await?;
    if !response.is_ok() {
        return Err(Error::transport(format!("{} returned HTTP {}", url, response.status)));
    }
    let text = response
        .text()
        .ok_or_else(|| Error::transport(format!("{} returned an empty body", url)))?;
    Ok(serde_json::from_str(text)?)
}
