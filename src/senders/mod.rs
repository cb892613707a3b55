//! # Request Senders
//!
//! Action components that perform the network call for the URL under test
//! and follow redirects themselves, one step per hop.
//!
//! ## Flow
//!
//! 1. Build the initial [`HopRequest`] from the run settings.
//! 2. Send it through a [`Transport`] (reqwest, or a browser client).
//! 3. Record status, headers and body on the current step.
//! 4. On a 3xx with a `Location` header (and redirects enabled), resolve the
//!    target against the *current* request URL, seal the step, and start a
//!    new one named `"<sender> (redirect #n)"`.
//! 5. Before sending a redirected hop, reject it when the target was already
//!    visited in this call ([`RequestError::CircularDependencyDetected`]) or
//!    when the hop count exceeds `max_redirections`
//!    ([`RequestError::MaxRedirectsExceeded`]).
//!
//! The final hop also publishes the whole [`HttpResponse`] under
//! [`keys::HTTP_RESPONSE_MESSAGE`] so validators can read it directly.

pub mod browser;
#[cfg(feature = "chromium")]
pub mod chromium;
pub mod http;

pub use browser::{BrowserClient, BrowserNavigation, BrowserRequestSender, BrowserTransport};
#[cfg(feature = "chromium")]
pub use chromium::ChromiumClient;
pub use http::{HttpRequestSender, ReqwestTransport};

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION,
    PROXY_AUTHORIZATION, USER_AGENT,
};
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use url::Url;

use crate::components::{ExecutionContext, TestComponent};
use crate::config::TestSettings;
use crate::errors::{ErrorCode, RequestError, StructuredError};
use crate::properties::{keys, PropertyValue};
use crate::session::StepKind;

// ============================================================================
// RESPONSE
// ============================================================================

/// Response of one hop, as seen by validators.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Only statuses that carry a follow-up target. 300 and 304 are final.
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }
}

/// Headers as a JSON object. Repeated headers are joined with `", "`.
pub fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_string(), Value::String(joined));
    }
    Value::Object(map)
}

// ============================================================================
// REQUEST
// ============================================================================

/// One request to send.
#[derive(Debug, Clone)]
pub struct HopRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl HopRequest {
    /// First request of a call, built from the run settings.
    pub fn initial(url: &Url, settings: &TestSettings) -> Result<Self, StructuredError> {
        let method = settings.request.method()?;
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.request.headers {
            let name = HeaderName::from_str(name).map_err(|_| {
                StructuredError::new(ErrorCode::INVALID_SETTINGS, format!("invalid header name '{}'", name))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                StructuredError::new(
                    ErrorCode::INVALID_SETTINGS,
                    format!("invalid value for header '{}'", name),
                )
            })?;
            headers.insert(name, value);
        }
        if let Some(agent) = &settings.user_agent {
            let value = HeaderValue::from_str(agent).map_err(|_| {
                StructuredError::new(ErrorCode::INVALID_SETTINGS, "invalid user agent")
            })?;
            headers.insert(USER_AGENT, value);
        }

        Ok(Self {
            url: url.clone(),
            method,
            headers,
            body: settings.request.body.clone(),
            timeout: settings.request_timeout(),
        })
    }

    /// Request for the redirect target of a `status` response.
    ///
    /// 303 (and 301/302 for anything but GET/HEAD) switch to GET without a
    /// body; 307/308 keep method and body. Credentials are not forwarded to a
    /// different host.
    pub fn redirected(&self, status: u16, target: Url) -> Self {
        let mut next = self.clone();

        let to_get = match status {
            303 => next.method != Method::HEAD,
            301 | 302 => next.method != Method::GET && next.method != Method::HEAD,
            _ => false,
        };
        if to_get {
            next.method = Method::GET;
            next.body = None;
            next.headers.remove(CONTENT_TYPE);
            next.headers.remove(CONTENT_LENGTH);
        }

        if target.host_str() != self.url.host_str() || target.port_or_known_default() != self.url.port_or_known_default() {
            next.headers.remove(AUTHORIZATION);
            next.headers.remove(PROXY_AUTHORIZATION);
            next.headers.remove(COOKIE);
        }

        next.url = target;
        next
    }
}

/// Transport result: the response plus transport-specific properties to
/// record on the hop's step.
#[derive(Debug)]
pub struct HopResponse {
    pub response: HttpResponse,
    pub extra: Vec<(String, PropertyValue)>,
}

impl From<HttpResponse> for HopResponse {
    fn from(response: HttpResponse) -> Self {
        Self { response, extra: Vec::new() }
    }
}

/// Sends exactly one request. Must never follow redirects on its own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HopRequest) -> Result<HopResponse, RequestError>;
}

// ============================================================================
// REDIRECT CHAIN
// ============================================================================

/// URLs visited by one call, in order. Never shared across calls.
#[derive(Debug, Clone)]
pub struct RedirectChain {
    order: Vec<Url>,
    visited: HashSet<String>,
}

impl RedirectChain {
    pub fn new(start: &Url) -> Self {
        let mut chain = Self {
            order: Vec::new(),
            visited: HashSet::new(),
        };
        chain.visit(start);
        chain
    }

    /// Records `url`. Returns `false` when it was already visited.
    pub fn visit(&mut self, url: &Url) -> bool {
        if !self.visited.insert(url.as_str().to_string()) {
            return false;
        }
        self.order.push(url.clone());
        true
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.visited.contains(url.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// `"A -> B -> C"`, optionally followed by the URL that closed a loop.
    pub fn render(&self, closing: Option<&Url>) -> String {
        self.order
            .iter()
            .chain(closing)
            .map(Url::as_str)
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

// ============================================================================
// SENDER COMPONENT
// ============================================================================

/// Action component driving the redirect loop over a [`Transport`].
pub struct RequestSender<T> {
    name: String,
    transport: T,
}

impl<T: Transport> RequestSender<T> {
    pub fn with_transport(name: impl Into<String>, transport: T) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn send_cancellable(
        &self,
        ctx: &ExecutionContext,
        request: &HopRequest,
    ) -> Result<HopResponse, RequestError> {
        let cancellation = ctx.cancellation().clone();
        tokio::select! {
            _ = cancellation.cancelled() => Err(RequestError::Cancelled { url: request.url.to_string() }),
            result = self.transport.send(request) => result,
        }
    }
}

fn record_response(ctx: &mut ExecutionContext, hop: &HopResponse) {
    let response = &hop.response;
    ctx.set(keys::HTTP_RESPONSE_STATUS, response.status);
    ctx.set(keys::HTTP_RESPONSE_HEADERS, headers_to_json(&response.headers));
    ctx.set(keys::HTTP_RESPONSE_CONTENT, response.text());
    for (key, value) in &hop.extra {
        ctx.set(key.clone(), value.clone());
    }
}

#[async_trait]
impl<T: Transport> TestComponent for RequestSender<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Action
    }

    #[instrument(name = "request_sender", skip_all, fields(component = %self.name, url = %ctx.url()))]
    async fn execute(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        let mut request = match HopRequest::initial(ctx.url(), ctx.settings()) {
            Ok(request) => request,
            Err(error) => {
                ctx.fail(error);
                return Ok(());
            }
        };
        let follow = ctx.settings().follow_redirects;
        let max = ctx.settings().max_redirections;
        let original = request.url.clone();
        let mut chain = RedirectChain::new(&original);
        let mut hop: u32 = 0;

        loop {
            ctx.set(keys::HTTP_REQUEST_URI, request.url.as_str());
            ctx.set(keys::HTTP_REQUEST_METHOD, request.method.as_str());
            ctx.set(keys::HTTP_REDIRECT_HOP, u64::from(hop));

            if hop > 0 {
                if chain.contains(&request.url) {
                    warn!(hop, url = %request.url, "Circular redirect");
                    ctx.fail(RequestError::CircularDependencyDetected {
                        url: request.url.to_string(),
                        chain: chain.render(Some(&request.url)),
                    });
                    return Ok(());
                }
                chain.visit(&request.url);

                if hop > max {
                    warn!(hop, max, url = %request.url, "Redirect limit exceeded");
                    ctx.fail(RequestError::MaxRedirectsExceeded {
                        original_url: original.to_string(),
                        last_url: request.url.to_string(),
                        max,
                    });
                    return Ok(());
                }
            }

            let hop_response = match self.send_cancellable(ctx, &request).await {
                Ok(response) => response,
                Err(error) => {
                    warn!(hop, error = %error, "❌ Request failed");
                    ctx.fail(error);
                    return Ok(());
                }
            };
            record_response(ctx, &hop_response);

            let response = hop_response.response;
            info!(hop, status = response.status, url = %request.url, "✅ Response received");

            if !(follow && response.is_redirect()) {
                ctx.set_handle(keys::HTTP_RESPONSE_MESSAGE, response);
                return Ok(());
            }

            let Some(location) = response.location().map(str::to_string) else {
                warn!(status = response.status, "Redirect without Location header; treating as final");
                ctx.set_handle(keys::HTTP_RESPONSE_MESSAGE, response);
                return Ok(());
            };

            let target = match request.url.join(&location) {
                Ok(target) => target,
                Err(_) => {
                    ctx.fail(RequestError::InvalidRedirectLocation {
                        url: request.url.to_string(),
                        location,
                    });
                    return Ok(());
                }
            };
            ctx.set(keys::HTTP_REDIRECT_LOCATION, target.as_str());

            hop += 1;
            request = request.redirected(response.status, target);
            ctx.next_hop(&format!("redirect #{}", hop));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory transport.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct Scripted {
        pub status: u16,
        pub location: Option<&'static str>,
        pub body: &'static str,
    }

    pub fn ok(body: &'static str) -> Scripted {
        Scripted { status: 200, location: None, body }
    }

    pub fn redirect(status: u16, location: &'static str) -> Scripted {
        Scripted { status, location: Some(location), body: "" }
    }

    /// Answers from a fixed URL → response table and records every request.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: HashMap<String, Scripted>,
        hang: bool,
        pub sent: Mutex<Vec<HopRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(mut self, url: &str, response: Scripted) -> Self {
            self.routes.insert(url.to_string(), response);
            self
        }

        /// Never answers.
        pub fn hanging() -> Self {
            Self { hang: true, ..Self::default() }
        }

        pub fn sent_urls(&self) -> Vec<String> {
            self.sent
                .lock()
                .map(|sent| sent.iter().map(|r| r.url.to_string()).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &HopRequest) -> Result<HopResponse, RequestError> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(request.clone());
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            let Some(scripted) = self.routes.get(request.url.as_str()) else {
                return Err(RequestError::ConnectionFailed {
                    url: request.url.to_string(),
                    reason: "no route".to_string(),
                });
            };
            let mut headers = HeaderMap::new();
            if let Some(location) = scripted.location {
                headers.insert(LOCATION, HeaderValue::from_static(location));
            }
            Ok(HttpResponse {
                url: request.url.clone(),
                status: scripted.status,
                headers,
                body: scripted.body.as_bytes().to_vec(),
            }
            .into())
        }
    }
}
