//! DNS resolution action: resolves the host of the URL under test and
//! publishes the addresses under [`keys::DNS_RESOLVED_IP_ADDRESSES`].

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use url::{Host, Url};

use super::{ExecutionContext, TestComponent};
use crate::errors::{ErrorCode, RequestError, StructuredError};
use crate::properties::keys;
use crate::session::StepKind;

pub struct DnsResolution {
    name: String,
}

impl DnsResolution {
    pub fn new() -> Self {
        Self::named("DnsResolution")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for DnsResolution {
    fn default() -> Self {
        Self::new()
    }
}

/// Host of `url` when it is an IP literal.
fn literal_address(url: &Url) -> Option<IpAddr> {
    match url.host()? {
        Host::Ipv4(ip) => Some(IpAddr::V4(ip)),
        Host::Ipv6(ip) => Some(IpAddr::V6(ip)),
        Host::Domain(_) => None,
    }
}

#[async_trait]
impl TestComponent for DnsResolution {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Action
    }

    #[instrument(name = "dns_resolution", skip_all, fields(url = %ctx.url()))]
    async fn execute(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        let url = ctx.url().clone();

        if let Some(ip) = literal_address(&url) {
            ctx.set(keys::DNS_RESOLVED_IP_ADDRESSES, vec![ip.to_string()]);
            return Ok(());
        }

        let Some(host) = url.host_str() else {
            ctx.fail(
                StructuredError::new(ErrorCode::INVALID_URL, "URL has no host to resolve")
                    .with_url(url.as_str()),
            );
            return Ok(());
        };
        let port = url.port_or_known_default().unwrap_or(80);
        let dns_timeout = ctx.settings().dns_timeout();
        let cancellation = ctx.cancellation().clone();

        let lookup = tokio::select! {
            _ = cancellation.cancelled() => {
                ctx.fail(RequestError::Cancelled { url: url.to_string() });
                return Ok(());
            }
            result = timeout(dns_timeout, lookup_host((host, port))) => result,
        };

        let addresses = match lookup {
            Err(_) => {
                warn!(host, timeout_ms = dns_timeout.as_millis() as u64, "DNS lookup timed out");
                ctx.fail(
                    StructuredError::new(
                        ErrorCode::DNS_RESOLUTION_FAILED,
                        format!("DNS lookup for {} timed out after {}ms", host, dns_timeout.as_millis()),
                    )
                    .with_url(url.as_str()),
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(host, error = %e, "DNS lookup failed");
                ctx.fail(
                    StructuredError::new(
                        ErrorCode::DNS_RESOLUTION_FAILED,
                        format!("DNS lookup for {} failed: {}", host, e),
                    )
                    .with_url(url.as_str()),
                );
                return Ok(());
            }
            Ok(Ok(found)) => {
                let mut unique: Vec<String> = Vec::new();
                for addr in found {
                    let ip = addr.ip().to_string();
                    if !unique.contains(&ip) {
                        unique.push(ip);
                    }
                }
                unique
            }
        };

        if addresses.is_empty() {
            ctx.fail(
                StructuredError::new(
                    ErrorCode::DNS_RESOLUTION_FAILED,
                    format!("{} did not resolve to any address", host),
                )
                .with_url(url.as_str()),
            );
            return Ok(());
        }

        info!(host, count = addresses.len(), "DNS resolved");
        ctx.set(keys::DNS_RESOLVED_IP_ADDRESSES, addresses);
        Ok(())
    }
}
