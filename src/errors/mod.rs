//! # Structured Error Codes
//!
//! Stable error codes attached to every failed step, so that dashboards,
//! alerting and CI integrations can react to *what* went wrong without
//! parsing free-form messages.
//!
//! ## Categories
//!
//! | Range  | Category      | Meaning                                         |
//! |--------|---------------|-------------------------------------------------|
//! | E1xxx  | Wiring        | Pipeline or settings are set up incorrectly     |
//! | E2xxx  | Request       | DNS, connection, HTTP or browser request failed |
//! | E3xxx  | Validation    | The target answered but a validator rejected it |
//! | E4xxx  | Environment   | Files, environment variables                    |
//! | E5xxx  | Internal      | Faults inside the engine or a component         |
//!
//! ## Example:
//!
//! ```text
//! [E2006] circular redirect detected: https://a.test/ was already visited
//!         (chain: https://a.test/ -> https://b.test/ -> https://a.test/)
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// ERROR CODE
// ============================================================================

/// Structured error code: one category digit followed by three digits
/// identifying the specific error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // ========================================================================
    // E1xxx: Wiring
    // ========================================================================

    /// The URL under test could not be parsed or has no host.
    pub const INVALID_URL: Self = Self(1001);

    /// Settings failed validation (bad method, bad header, ...).
    pub const INVALID_SETTINGS: Self = Self(1002);

    /// A component needs data that a prior component should have produced.
    /// Example: reachability check registered without a DNS lookup before it.
    pub const MISSING_PREREQUISITE: Self = Self(1003);

    // ========================================================================
    // E2xxx: Request
    // ========================================================================

    /// The request did not complete within the configured timeout.
    pub const REQUEST_TIMEOUT: Self = Self(2001);

    /// Connection could not be established.
    pub const CONNECTION_ERROR: Self = Self(2002);

    /// Host name did not resolve.
    pub const DNS_RESOLUTION_FAILED: Self = Self(2003);

    /// None of the resolved addresses accepted a connection.
    pub const UNREACHABLE: Self = Self(2004);

    /// Any other transport level failure.
    pub const TRANSPORT_ERROR: Self = Self(2005);

    /// A redirect pointed back to an already visited URL.
    pub const CIRCULAR_REDIRECT: Self = Self(2006);

    /// More redirects than `max_redirections` allows.
    pub const MAX_REDIRECTS_EXCEEDED: Self = Self(2007);

    /// `Location` header could not be resolved to an absolute URL.
    pub const INVALID_REDIRECT_LOCATION: Self = Self(2008);

    /// Browser navigation failed.
    pub const BROWSER_NAVIGATION_FAILED: Self = Self(2009);

    // ========================================================================
    // E3xxx: Validation
    // ========================================================================

    /// A validator rejected the response.
    pub const VALIDATION_FAILED: Self = Self(3001);

    /// Status code outside the accepted set.
    pub const UNEXPECTED_STATUS: Self = Self(3002);

    /// Expected header is missing.
    pub const HEADER_MISSING: Self = Self(3003);

    /// Response content did not contain / match the expected text.
    pub const CONTENT_MISMATCH: Self = Self(3004);

    // ========================================================================
    // E4xxx: Environment
    // ========================================================================

    /// Settings file missing or unreadable.
    pub const SETTINGS_FILE_ERROR: Self = Self(4001);

    /// Environment variable present but not parseable.
    pub const INVALID_ENV_VAR: Self = Self(4002);

    // ========================================================================
    // E5xxx: Internal
    // ========================================================================

    /// Component returned an unexpected error.
    pub const COMPONENT_FAULT: Self = Self(5001);

    /// Component panicked.
    pub const COMPONENT_PANIC: Self = Self(5002);

    /// Session could not be serialized.
    pub const SERIALIZATION_ERROR: Self = Self(5003);

    /// The run was cancelled.
    pub const CANCELLED: Self = Self(5004);

    // ========================================================================
    // METHODS
    // ========================================================================

    /// Numeric code. `ErrorCode::CIRCULAR_REDIRECT.code() == 2006`
    pub fn code(&self) -> u16 {
        self.0
    }

    /// Code with the "E" prefix. `ErrorCode::CIRCULAR_REDIRECT.formatted() == "E2006"`
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    /// Category derived from the first digit.
    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Wiring,
            2 => ErrorCategory::Request,
            3 => ErrorCategory::Validation,
            4 => ErrorCategory::Environment,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Short description, suitable for logs.
    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "Invalid URL",
            1002 => "Invalid settings",
            1003 => "Missing prerequisite component",
            2001 => "Request timed out",
            2002 => "Connection error",
            2003 => "DNS resolution failed",
            2004 => "Target unreachable",
            2005 => "Transport error",
            2006 => "Circular redirect",
            2007 => "Redirect limit exceeded",
            2008 => "Invalid redirect location",
            2009 => "Browser navigation failed",
            3001 => "Validation failed",
            3002 => "Unexpected status code",
            3003 => "Header missing",
            3004 => "Content mismatch",
            4001 => "Settings file error",
            4002 => "Invalid environment variable",
            5001 => "Component fault",
            5002 => "Component panicked",
            5003 => "Serialization error",
            5004 => "Cancelled",
            _ => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// ERROR CATEGORY
// ============================================================================

/// Category of an error code, for grouping in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Pipeline or settings wiring (E1xxx).
    Wiring,
    /// Network request (E2xxx).
    Request,
    /// Validator rejection (E3xxx).
    Validation,
    /// Files and environment (E4xxx).
    Environment,
    /// Engine internals (E5xxx).
    Internal,
    /// Outside the known ranges.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wiring => write!(f, "Wiring"),
            Self::Request => write!(f, "Request"),
            Self::Validation => write!(f, "Validation"),
            Self::Environment => write!(f, "Environment"),
            Self::Internal => write!(f, "Internal"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

// ============================================================================
// STRUCTURED ERROR
// ============================================================================

/// Error with code, message and optional context. This is what a component
/// hands to [`crate::components::ExecutionContext::fail`].
#[derive(Debug, Clone)]
pub struct StructuredError {
    /// Error code.
    pub code: ErrorCode,
    /// Detailed message.
    pub message: String,
    /// Additional context.
    pub context: Option<ErrorContext>,
}

/// Additional error context.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// URL the error relates to.
    pub url: Option<String>,
    /// Expected value.
    pub expected: Option<String>,
    /// Actual value.
    pub actual: Option<String>,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Adds the URL to the context.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.context.get_or_insert_with(ErrorContext::default).url = Some(url.into());
        self
    }

    /// Adds expected/actual values to the context.
    pub fn with_expectation(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        ctx.expected = Some(expected.into());
        ctx.actual = Some(actual.into());
        self
    }

    /// Formats the error for display to the user.
    pub fn user_message(&self) -> String {
        let mut msg = format!("[{}] {}", self.code, self.message);

        if let Some(ctx) = &self.context {
            if let Some(url) = &ctx.url {
                msg.push_str(&format!(" (url: {})", url));
            }
            if let (Some(expected), Some(actual)) = (&ctx.expected, &ctx.actual) {
                msg.push_str(&format!(" [expected: {}, actual: {}]", expected, actual));
            }
        }

        msg
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for StructuredError {}

// ============================================================================
// REQUEST ERRORS
// ============================================================================

/// Failure modes of a request sender. All of them end up as a failed step,
/// never as an error escaping the component.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("circular redirect detected: {url} was already visited (chain: {chain})")]
    CircularDependencyDetected { url: String, chain: String },

    #[error("redirect limit of {max} exceeded while requesting {original_url} (last redirect: {last_url})")]
    MaxRedirectsExceeded {
        original_url: String,
        last_url: String,
        max: u32,
    },

    #[error("request to {url} timed out after {}ms", timeout.as_millis())]
    RequestTimedOut { url: String, timeout: Duration },

    #[error("could not connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("request to {url} failed: {reason}")]
    TransportError { url: String, reason: String },

    #[error("redirect from {url} has an unusable Location header '{location}'")]
    InvalidRedirectLocation { url: String, location: String },

    #[error("browser navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },

    #[error("request to {url} was cancelled")]
    Cancelled { url: String },
}

impl RequestError {
    /// Stable code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CircularDependencyDetected { .. } => ErrorCode::CIRCULAR_REDIRECT,
            Self::MaxRedirectsExceeded { .. } => ErrorCode::MAX_REDIRECTS_EXCEEDED,
            Self::RequestTimedOut { .. } => ErrorCode::REQUEST_TIMEOUT,
            Self::ConnectionFailed { .. } => ErrorCode::CONNECTION_ERROR,
            Self::TransportError { .. } => ErrorCode::TRANSPORT_ERROR,
            Self::InvalidRedirectLocation { .. } => ErrorCode::INVALID_REDIRECT_LOCATION,
            Self::NavigationFailed { .. } => ErrorCode::BROWSER_NAVIGATION_FAILED,
            Self::Cancelled { .. } => ErrorCode::CANCELLED,
        }
    }
}

impl From<RequestError> for StructuredError {
    fn from(err: RequestError) -> Self {
        StructuredError::new(err.code(), err.to_string())
    }
}
