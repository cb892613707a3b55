//! [`BrowserClient`] backed by headless Chrome through `chromiumoxide`.
//!
//! Chrome follows redirects internally, so a browser sender built on this
//! client records a single step per navigation, carrying the final document.
//!
//! Each navigation runs in its own task that always closes its tab, even when
//! the caller stops waiting (timeout or cancellation).

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::browser::{BrowserClient, BrowserNavigation};
use crate::errors::RequestError;

pub struct ChromiumClient {
    browser: Arc<Mutex<Option<Browser>>>,
    handler: JoinHandle<()>,
}

impl ChromiumClient {
    /// Launches a headless Chrome with its own throwaway profile directory.
    pub async fn launch() -> anyhow::Result<Self> {
        let profile = std::env::temp_dir().join(format!("webprobe-chrome-{}", uuid::Uuid::new_v4()));
        let config = BrowserConfig::builder()
            .arg("--headless")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg(format!("--user-data-dir={}", profile.display()))
            .build()
            .map_err(|e| anyhow::anyhow!("invalid browser configuration: {}", e))?;

        let (browser, mut handler) = Browser::launch(config).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser handler error: {}", e);
                }
            }
        });
        debug!("Chrome launched");

        Ok(Self {
            browser: Arc::new(Mutex::new(Some(browser))),
            handler,
        })
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            browser.close().await?;
        }
        self.handler.abort();
        Ok(())
    }
}

async fn open_page(browser: &Mutex<Option<Browser>>, url: &Url) -> Result<Page, RequestError> {
    let guard = browser.lock().await;
    let browser = guard.as_ref().ok_or_else(|| RequestError::NavigationFailed {
        url: url.to_string(),
        reason: "browser already closed".to_string(),
    })?;
    browser
        .new_page("about:blank")
        .await
        .map_err(|e| RequestError::NavigationFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

async fn read_page(page: &Page, url: &Url) -> Result<BrowserNavigation, RequestError> {
    let failed = |reason: String| RequestError::NavigationFailed {
        url: url.to_string(),
        reason,
    };

    page.goto(url.as_str()).await.map_err(|e| failed(e.to_string()))?;
    let document = page
        .wait_for_navigation_response()
        .await
        .map_err(|e| failed(e.to_string()))?;

    let (status, headers) = match document.as_ref().and_then(|request| request.response.as_ref()) {
        Some(response) => {
            let raw = serde_json::to_value(&response.headers).unwrap_or_default();
            (u16::try_from(response.status).unwrap_or(0), to_header_map(&raw))
        }
        None => (200, HeaderMap::new()),
    };

    let content = page.content().await.map_err(|e| failed(e.to_string()))?;
    let final_url = page
        .url()
        .await
        .map_err(|e| failed(e.to_string()))?
        .and_then(|u| Url::parse(&u).ok())
        .unwrap_or_else(|| url.clone());

    Ok(BrowserNavigation {
        status,
        headers,
        content,
        final_url,
    })
}

fn to_header_map(raw: &serde_json::Value) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(object) = raw.as_object() {
        for (name, value) in object {
            let Some(value) = value.as_str() else { continue };
            if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
                headers.append(name, value);
            }
        }
    }
    headers
}

/// Opens a tab, reads it within `timeout`, and closes it whatever happened.
async fn navigate_in_tab(
    browser: Arc<Mutex<Option<Browser>>>,
    url: Url,
    timeout: Duration,
) -> Result<BrowserNavigation, RequestError> {
    let page = open_page(&browser, &url).await?;
    let result = match tokio::time::timeout(timeout, read_page(&page, &url)).await {
        Ok(result) => result,
        Err(_) => Err(RequestError::RequestTimedOut {
            url: url.to_string(),
            timeout,
        }),
    };
    if let Err(e) = page.close().await {
        debug!(error = %e, "Page close failed");
    }
    result
}

#[async_trait]
impl BrowserClient for ChromiumClient {
    async fn navigate(&self, url: &Url, timeout: Duration) -> Result<BrowserNavigation, RequestError> {
        detached(url, navigate_in_tab(self.browser.clone(), url.clone(), timeout)).await
    }
}

/// Runs `work` on its own task; dropping the returned future leaves it running.
async fn detached<T, F>(url: &Url, work: F) -> Result<T, RequestError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, RequestError>> + Send + 'static,
{
    tokio::spawn(work).await.map_err(|e| RequestError::NavigationFailed {
        url: url.to_string(),
        reason: format!("navigation task failed: {}", e),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_from_cdp_headers() {
        let raw = serde_json::json!({
            "content-type": "text/html",
            "x-count": 3,
        });
        let headers = to_header_map(&raw);
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
        assert!(!headers.contains_key("x-count"));
    }

    #[tokio::test]
    async fn test_navigation_on_closed_browser_fails() {
        let url = Url::parse("http://example.com/").unwrap();
        let err = navigate_in_tab(Arc::new(Mutex::new(None)), url, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::NavigationFailed { .. }));
    }

    #[tokio::test]
    async fn test_detached_work_finishes_after_caller_gives_up() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let url = Url::parse("http://example.com/").unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let work = async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        };

        let outcome = tokio::time::timeout(Duration::from_millis(5), detached(&url, work)).await;
        assert!(outcome.is_err());
        assert!(!closed.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_detached_reports_panicked_work() {
        let url = Url::parse("http://example.com/").unwrap();
        let err = detached::<(), _>(&url, async { panic!("tab crashed") }).await.unwrap_err();
        match err {
            RequestError::NavigationFailed { reason, .. } => assert!(reason.contains("navigation task failed")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
