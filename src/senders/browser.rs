//! Browser-driven sender.
//!
//! A [`BrowserClient`] navigates a real (usually headless) browser and hands
//! back an HTTP-equivalent view of the main document: status, headers and the
//! rendered page. The redirect loop is the same as for plain HTTP, so a
//! client that surfaces 3xx navigations gets per-hop steps and cycle
//! detection for free; a client whose browser follows redirects internally
//! simply reports the final document.
//!
//! Besides the usual response properties, each hop records the rendered DOM
//! under [`keys::BROWSER_PAGE_CONTENT`] and the address the browser ended on
//! under [`keys::BROWSER_FINAL_URL`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tracing::debug;
use url::Url;

use super::{HopRequest, HopResponse, HttpResponse, RequestSender, Transport};
use crate::errors::RequestError;
use crate::properties::keys;

/// Result of one navigation.
#[derive(Debug, Clone)]
pub struct BrowserNavigation {
    pub status: u16,
    pub headers: HeaderMap,
    /// Serialized DOM after the page settled.
    pub content: String,
    pub final_url: Url,
}

#[async_trait]
pub trait BrowserClient: Send + Sync {
    async fn navigate(&self, url: &Url, timeout: Duration) -> Result<BrowserNavigation, RequestError>;
}

/// Adapts a [`BrowserClient`] to the sender's [`Transport`] contract.
pub struct BrowserTransport<C> {
    client: C,
}

impl<C: BrowserClient> BrowserTransport<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: BrowserClient> Transport for BrowserTransport<C> {
    async fn send(&self, request: &HopRequest) -> Result<HopResponse, RequestError> {
        debug!(url = %request.url, "Navigating");
        let navigation = tokio::time::timeout(request.timeout, self.client.navigate(&request.url, request.timeout))
            .await
            .map_err(|_| RequestError::RequestTimedOut {
                url: request.url.to_string(),
                timeout: request.timeout,
            })??;

        let extra = vec![
            (keys::BROWSER_PAGE_CONTENT.to_string(), navigation.content.clone().into()),
            (keys::BROWSER_FINAL_URL.to_string(), navigation.final_url.as_str().into()),
        ];
        Ok(HopResponse {
            response: HttpResponse {
                url: navigation.final_url,
                status: navigation.status,
                headers: navigation.headers,
                body: navigation.content.into_bytes(),
            },
            extra,
        })
    }
}

pub type BrowserRequestSender<C> = RequestSender<BrowserTransport<C>>;

impl<C: BrowserClient> RequestSender<BrowserTransport<C>> {
    pub fn browser(name: impl Into<String>, client: C) -> Self {
        Self::with_transport(name, BrowserTransport::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::context;
    use crate::components::TestComponent;
    use reqwest::header::{HeaderValue, LOCATION};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Redirects `/old` to `/new` once, then serves a page.
    struct FakeBrowser {
        navigations: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeBrowser {
        fn new() -> Self {
            Self { navigations: AtomicUsize::new(0), delay: None }
        }
    }

    #[async_trait]
    impl BrowserClient for FakeBrowser {
        async fn navigate(&self, url: &Url, _timeout: Duration) -> Result<BrowserNavigation, RequestError> {
            self.navigations.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut headers = HeaderMap::new();
            if url.path() == "/old" {
                headers.insert(LOCATION, HeaderValue::from_static("/new"));
                return Ok(BrowserNavigation {
                    status: 301,
                    headers,
                    content: String::new(),
                    final_url: url.clone(),
                });
            }
            Ok(BrowserNavigation {
                status: 200,
                headers,
                content: "<html><body>rendered</body></html>".to_string(),
                final_url: url.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_browser_hops_record_page_content() {
        let sender = BrowserRequestSender::browser("Browser", FakeBrowser::new());
        let mut ctx = context("https://site.test/old");
        ctx.begin_component(0, &sender);
        sender.execute(&mut ctx).await.unwrap();
        ctx.complete_component();

        let steps = ctx.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].name(), "Browser (redirect #1)");
        assert_eq!(
            steps[1].properties().get::<String>(keys::BROWSER_PAGE_CONTENT).as_deref(),
            Some("<html><body>rendered</body></html>")
        );
        assert_eq!(
            steps[1].properties().get::<String>(keys::BROWSER_FINAL_URL).as_deref(),
            Some("https://site.test/new")
        );
        assert_eq!(sender.transport().client().navigations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_navigation_times_out() {
        let client = FakeBrowser {
            navigations: AtomicUsize::new(0),
            delay: Some(Duration::from_secs(5)),
        };
        let transport = BrowserTransport::new(client);
        let request = HopRequest {
            url: Url::parse("https://site.test/").unwrap(),
            method: reqwest::Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_millis(50),
        };

        let err = transport.send(&request).await.unwrap_err();
        assert!(matches!(err, RequestError::RequestTimedOut { .. }));
    }
}
