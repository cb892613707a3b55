//! Reachability action: opens a TCP connection to every address published by
//! a prior DNS resolution step. Fails when none of them answers.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{ExecutionContext, TestComponent};
use crate::errors::{ErrorCode, RequestError, StructuredError};
use crate::properties::keys;
use crate::session::StepKind;

pub struct ReachabilityCheck {
    name: String,
}

impl ReachabilityCheck {
    pub fn new() -> Self {
        Self::named("ReachabilityCheck")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ReachabilityCheck {
    fn default() -> Self {
        Self::new()
    }
}

enum Probe {
    Reachable,
    Unreachable(String),
    Cancelled,
}

async fn probe_address(
    address: SocketAddr,
    connect_timeout: Duration,
    cancellation: &CancellationToken,
) -> Probe {
    tokio::select! {
        _ = cancellation.cancelled() => Probe::Cancelled,
        result = timeout(connect_timeout, TcpStream::connect(address)) => match result {
            Ok(Ok(_stream)) => Probe::Reachable,
            Ok(Err(e)) => Probe::Unreachable(e.to_string()),
            Err(_) => Probe::Unreachable(format!("no answer within {}ms", connect_timeout.as_millis())),
        },
    }
}

#[async_trait]
impl TestComponent for ReachabilityCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Action
    }

    #[instrument(name = "reachability_check", skip_all, fields(url = %ctx.url()))]
    async fn execute(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        let Some(addresses) = ctx.find::<Vec<String>>(keys::DNS_RESOLVED_IP_ADDRESSES) else {
            ctx.fail(StructuredError::new(
                ErrorCode::MISSING_PREREQUISITE,
                format!(
                    "reachability check requires a DNS resolution step before it (no '{}' property found)",
                    keys::DNS_RESOLVED_IP_ADDRESSES
                ),
            ));
            return Ok(());
        };

        let port = ctx
            .settings()
            .reachability_port
            .or_else(|| ctx.url().port_or_known_default())
            .unwrap_or(80);
        let connect_timeout = ctx.settings().connect_timeout();
        let cancellation = ctx.cancellation().clone();

        let targets: Vec<(String, SocketAddr)> = addresses
            .iter()
            .filter_map(|raw| {
                raw.parse::<IpAddr>()
                    .ok()
                    .map(|ip| (raw.clone(), SocketAddr::new(ip, port)))
            })
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|(_, addr)| probe_address(*addr, connect_timeout, &cancellation)),
        )
        .await;

        if results.iter().any(|r| matches!(r, Probe::Cancelled)) {
            ctx.fail(RequestError::Cancelled { url: ctx.url().to_string() });
            return Ok(());
        }

        let mut reachable = Vec::new();
        let mut failures = Vec::new();
        for ((raw, addr), result) in targets.iter().zip(results) {
            match result {
                Probe::Reachable => reachable.push(raw.clone()),
                Probe::Unreachable(reason) => {
                    debug!(%addr, %reason, "Address unreachable");
                    failures.push(format!("{}: {}", addr, reason));
                }
                Probe::Cancelled => {}
            }
        }

        info!(port, reachable = reachable.len(), total = targets.len(), "Reachability checked");
        let none_reachable = reachable.is_empty();
        ctx.set(keys::REACHABLE_IP_ADDRESSES, reachable);

        if none_reachable {
            let detail = if failures.is_empty() {
                "no usable address".to_string()
            } else {
                failures.join("; ")
            };
            ctx.fail(
                StructuredError::new(
                    ErrorCode::UNREACHABLE,
                    format!("no resolved address accepted a connection on port {} ({})", port, detail),
                )
                .with_url(ctx.url().as_str()),
            );
        }
        Ok(())
    }
}
