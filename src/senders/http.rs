//! HTTP transport backed by `reqwest`, with built-in redirects disabled so
//! the sender's own loop sees every hop.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{redirect, Client};
use tracing::debug;

use super::{HopRequest, HopResponse, HttpResponse, RequestSender, Transport};
use crate::config::DEFAULT_CONNECT_TIMEOUT_MS;
use crate::errors::RequestError;

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_connect_timeout(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Uses a caller-built client. It must not follow redirects.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_error(url: &str, request: &HopRequest, err: reqwest::Error) -> RequestError {
    if err.is_timeout() {
        RequestError::RequestTimedOut {
            url: url.to_string(),
            timeout: request.timeout,
        }
    } else if err.is_connect() {
        RequestError::ConnectionFailed {
            url: url.to_string(),
            reason: err.to_string(),
        }
    } else {
        RequestError::TransportError {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HopRequest) -> Result<HopResponse, RequestError> {
        let url = request.url.as_str();
        debug!(method = %request.method, url, "Sending HTTP request");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| map_error(url, request, e))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_error(url, request, e))?
            .to_vec();

        Ok(HttpResponse {
            url: request.url.clone(),
            status,
            headers,
            body,
        }
        .into())
    }
}

/// Request sender speaking plain HTTP.
pub type HttpRequestSender = RequestSender<ReqwestTransport>;

impl RequestSender<ReqwestTransport> {
    pub fn new(name: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self::with_transport(name, ReqwestTransport::new()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{ExecutionContext, ExecutionMode, TestComponent};
    use crate::config::TestSettings;
    use crate::properties::keys;
    use crate::session::TestStep;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    /// Minimal HTTP/1.1 server: `/a` → 302 `/b`, `/b` → 200, `/loop` → 301
    /// `/loop`, `/slow` sleeps before answering.
    async fn serve() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&buf[..n]).to_string();
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let response = match path.as_str() {
                        "/a" => "HTTP/1.1 302 Found\r\nLocation: /b\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                        "/b" => "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".to_string(),
                        "/loop" => "HTTP/1.1 301 Moved Permanently\r\nLocation: /loop\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                        "/slow" => {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                        }
                        _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        base
    }

    async fn run(url: &str, settings: TestSettings) -> Vec<TestStep> {
        let sender = HttpRequestSender::new("Http").unwrap();
        let mut ctx = ExecutionContext::new(
            Url::parse(url).unwrap(),
            Arc::new(settings),
            CancellationToken::new(),
            ExecutionMode::Run,
            "unit",
        );
        ctx.begin_component(0, &sender);
        sender.execute(&mut ctx).await.unwrap();
        ctx.complete_component();
        ctx.steps().to_vec()
    }

    #[tokio::test]
    async fn test_follows_relative_redirect() {
        let base = serve().await;
        let steps = run(&format!("{}/a", base), TestSettings::default()).await;

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].properties().get::<u16>(keys::HTTP_RESPONSE_STATUS), Some(302));
        assert_eq!(steps[1].properties().get::<u16>(keys::HTTP_RESPONSE_STATUS), Some(200));
        assert_eq!(
            steps[1].properties().get::<String>(keys::HTTP_REQUEST_URI),
            Some(format!("{}/b", base))
        );
        assert_eq!(
            steps[1].properties().get::<String>(keys::HTTP_RESPONSE_CONTENT).as_deref(),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn test_self_redirect_is_circular() {
        let base = serve().await;
        let steps = run(&format!("{}/loop", base), TestSettings::default()).await;

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].error_code(), Some("E2006"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_with_configured_duration() {
        let base = serve().await;
        let settings = TestSettings {
            request_timeout_ms: 200,
            ..TestSettings::default()
        };
        let steps = run(&format!("{}/slow", base), settings).await;

        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].error_code(), Some("E2001"));
        assert!(steps[0].error().unwrap().contains("200ms"));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let steps = run(&format!("http://127.0.0.1:{}/", port), TestSettings::default()).await;
        assert_eq!(steps[0].error_code(), Some("E2002"));
    }
}
