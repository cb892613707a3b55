//! # Configuration and Limits
//!
//! Settings for one run ([`TestSettings`]) and for the agent that executes
//! runs ([`AgentConfig`]). Every field has a safe default, so an empty JSON
//! object `{}` is a valid settings file.
//!
//! ## Limits
//!
//! | Limit                    | Value   | Meaning                                  |
//! |--------------------------|---------|------------------------------------------|
//! | MAX_REDIRECTIONS_LIMIT   | 50      | Upper bound for `max_redirections`       |
//! | MAX_REQUEST_TIMEOUT_MS   | 300000  | Upper bound for any per-hop timeout (5m) |
//!
//! ## Environment overrides
//!
//! | Variable                          | Field                          |
//! |-----------------------------------|--------------------------------|
//! | `WEBPROBE_FOLLOW_REDIRECTS`       | `TestSettings::follow_redirects` |
//! | `WEBPROBE_MAX_REDIRECTIONS`       | `TestSettings::max_redirections` |
//! | `WEBPROBE_REQUEST_TIMEOUT_MS`     | `TestSettings::request_timeout_ms` |
//! | `WEBPROBE_AGENT_NAME`             | `AgentConfig::name`            |
//! | `WEBPROBE_INSTANTIATE_PER_THREAD` | `AgentConfig::instantiate_per_thread` |
//! | `WEBPROBE_CONTINUE_ON_FAILURE`    | `AgentConfig::continue_on_failure` |

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{ErrorCode, StructuredError};

// ============================================================================
// DEFAULTS AND LIMITS
// ============================================================================

pub const DEFAULT_MAX_REDIRECTIONS: u32 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DNS_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_AGENT_NAME: &str = "webprobe-agent";

/// Redirect chains longer than this are never followed, whatever the settings say.
pub const MAX_REDIRECTIONS_LIMIT: u32 = 50;

/// No single hop may wait longer than this.
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

// ============================================================================
// TEST SETTINGS
// ============================================================================

/// Method, headers and body sent by the request senders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

impl RequestSettings {
    pub fn method(&self) -> Result<Method, StructuredError> {
        Method::from_str(&self.method.to_uppercase()).map_err(|_| {
            StructuredError::new(
                ErrorCode::INVALID_SETTINGS,
                format!("'{}' is not a valid HTTP method", self.method),
            )
        })
    }
}

/// Settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Follow 3xx responses with a `Location` header.
    pub follow_redirects: bool,
    /// Maximum number of redirect hops after the initial request.
    pub max_redirections: u32,
    /// Per-hop request timeout.
    pub request_timeout_ms: u64,
    /// TCP connect timeout (reachability check and HTTP transport).
    pub connect_timeout_ms: u64,
    /// DNS lookup timeout.
    pub dns_timeout_ms: u64,
    /// Port probed by the reachability check. `None` uses the URL's port.
    pub reachability_port: Option<u16>,
    pub user_agent: Option<String>,
    pub request: RequestSettings,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            max_redirections: DEFAULT_MAX_REDIRECTIONS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            dns_timeout_ms: DEFAULT_DNS_TIMEOUT_MS,
            reachability_port: None,
            user_agent: None,
            request: RequestSettings::default(),
        }
    }
}

impl TestSettings {
    /// Defaults overridden by `WEBPROBE_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    /// Applies overrides from `lookup`. Unparseable values are logged and skipped.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_env(&lookup, "WEBPROBE_FOLLOW_REDIRECTS") {
            self.follow_redirects = v;
        }
        if let Some(v) = parse_env(&lookup, "WEBPROBE_MAX_REDIRECTIONS") {
            self.max_redirections = v;
        }
        if let Some(v) = parse_env(&lookup, "WEBPROBE_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = v;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    /// Clamps numeric fields into the allowed range and checks the request
    /// method and headers.
    pub fn validated(mut self) -> Result<Self, StructuredError> {
        if self.max_redirections > MAX_REDIRECTIONS_LIMIT {
            warn!(
                requested = self.max_redirections,
                limit = MAX_REDIRECTIONS_LIMIT,
                "max_redirections clamped"
            );
            self.max_redirections = MAX_REDIRECTIONS_LIMIT;
        }
        self.request_timeout_ms = clamp_timeout(self.request_timeout_ms, "request_timeout_ms");
        self.connect_timeout_ms = clamp_timeout(self.connect_timeout_ms, "connect_timeout_ms");
        self.dns_timeout_ms = clamp_timeout(self.dns_timeout_ms, "dns_timeout_ms");

        self.request.method()?;
        for (name, value) in &self.request.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                StructuredError::new(ErrorCode::INVALID_SETTINGS, format!("invalid header name '{}'", name))
            })?;
            HeaderValue::from_str(value).map_err(|_| {
                StructuredError::new(
                    ErrorCode::INVALID_SETTINGS,
                    format!("invalid value for header '{}'", name),
                )
            })?;
        }
        Ok(self)
    }
}

fn clamp_timeout(value: u64, field: &str) -> u64 {
    let clamped = value.clamp(1, MAX_REQUEST_TIMEOUT_MS);
    if clamped != value {
        warn!(field, requested = value, applied = clamped, "Timeout clamped");
    }
    clamped
}

// ============================================================================
// AGENT CONFIG
// ============================================================================

/// How a [`crate::agent::TestAgent`] owns and runs its pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name recorded on every session.
    pub name: String,
    /// One pipeline per worker (true) or one pipeline shared by all callers.
    pub instantiate_per_thread: bool,
    /// Keep executing components after a failed step.
    pub continue_on_failure: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT_NAME.to_string(),
            instantiate_per_thread: true,
            continue_on_failure: false,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("WEBPROBE_AGENT_NAME") {
            self.name = name;
        }
        if let Some(v) = parse_env(&lookup, "WEBPROBE_INSTANTIATE_PER_THREAD") {
            self.instantiate_per_thread = v;
        }
        if let Some(v) = parse_env(&lookup, "WEBPROBE_CONTINUE_ON_FAILURE") {
            self.continue_on_failure = v;
        }
    }
}

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                code = %ErrorCode::INVALID_ENV_VAR,
                variable = key,
                value = %raw,
                "Ignoring unparseable environment variable"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = TestSettings::default();
        assert!(settings.follow_redirects);
        assert_eq!(settings.max_redirections, 10);
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.request.method, "GET");

        let agent = AgentConfig::default();
        assert!(agent.instantiate_per_thread);
        assert!(!agent.continue_on_failure);
    }

    #[test]
    fn test_empty_json_is_default() {
        let settings: TestSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, TestSettings::default());

        let settings: TestSettings =
            serde_json::from_str(r#"{"max_redirections": 1, "request": {"method": "post"}}"#).unwrap();
        assert_eq!(settings.max_redirections, 1);
        assert_eq!(settings.request.method().unwrap(), Method::POST);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WEBPROBE_FOLLOW_REDIRECTS", "false"),
            ("WEBPROBE_MAX_REDIRECTIONS", "3"),
            ("WEBPROBE_REQUEST_TIMEOUT_MS", "not-a-number"),
            ("WEBPROBE_CONTINUE_ON_FAILURE", "true"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let mut settings = TestSettings::default();
        settings.apply_env(lookup);
        assert!(!settings.follow_redirects);
        assert_eq!(settings.max_redirections, 3);
        assert_eq!(settings.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);

        let mut agent = AgentConfig::default();
        agent.apply_env(lookup);
        assert!(agent.continue_on_failure);
        assert_eq!(agent.name, DEFAULT_AGENT_NAME);
    }

    #[test]
    fn test_validated_clamps_limits() {
        let settings = TestSettings {
            max_redirections: 500,
            request_timeout_ms: 0,
            dns_timeout_ms: 10_000_000,
            ..Default::default()
        }
        .validated()
        .unwrap();

        assert_eq!(settings.max_redirections, MAX_REDIRECTIONS_LIMIT);
        assert_eq!(settings.request_timeout_ms, 1);
        assert_eq!(settings.dns_timeout_ms, MAX_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn test_validated_rejects_bad_request() {
        let mut settings = TestSettings::default();
        settings.request.method = "NOT A METHOD".to_string();
        let err = settings.validated().unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_SETTINGS);

        let mut settings = TestSettings::default();
        settings.request.headers.insert("bad header".to_string(), "x".to_string());
        assert!(settings.validated().is_err());
    }
}
