//! # Session Model
//!
//! Result records produced by a pipeline run:
//!
//! - [`TestStep`]: outcome of one component execution (or of one redirect
//!   hop inside a request sender), with its [`PropertyBag`].
//! - [`TestSession`]: the URL under test plus every step, in execution order.
//!
//! Both are immutable once built; the only way to assemble them is the
//! [`TestSessionBuilder`]. Sessions round-trip through JSON: step order and
//! serializable properties survive, in-memory handles are dropped.

mod builder;

pub use builder::TestSessionBuilder;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ErrorCode;
use crate::properties::PropertyBag;

/// Discriminates action steps (produce data) from validation steps (assert on it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Action,
    Validation,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Action => write!(f, "action"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepResult {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Every component ran and no step failed (ignored failures aside).
    Completed,
    /// A step failed, a component faulted, or the run was cancelled.
    Failed,
    /// Cancelled before any component ran.
    Declined,
}

// ============================================================================
// TEST STEP
// ============================================================================

/// Immutable record of one component execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStep {
    name: String,
    kind: StepKind,
    /// Position of the producing component in the pipeline.
    component_index: usize,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    result: StepResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    failure_ignored: bool,
    #[serde(default)]
    properties: PropertyBag,
}

impl TestStep {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn component_index(&self) -> usize {
        self.component_index
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn result(&self) -> StepResult {
        self.result
    }

    pub fn succeeded(&self) -> bool {
        self.result == StepResult::Succeeded
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Formatted error code, e.g. `"E2006"`.
    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    /// True when the step failed but its component declared the failure as expected.
    pub fn failure_ignored(&self) -> bool {
        self.failure_ignored
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// Failed and not excused.
    pub(crate) fn counts_as_failure(&self) -> bool {
        self.result == StepResult::Failed && !self.failure_ignored
    }
}

// ============================================================================
// TEST SESSION
// ============================================================================

/// Full, ordered result of one run against one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSession {
    id: Uuid,
    agent: String,
    url: String,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    state: SessionState,
    validity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    steps: Vec<TestStep>,
}

impl TestSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True iff no step failed, or every failure was expected.
    pub fn validity(&self) -> bool {
        self.validity
    }

    /// Fault or cancellation detail, when the run did not finish normally.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn steps(&self) -> &[TestStep] {
        &self.steps
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &TestStep> {
        self.steps.iter().filter(|s| s.result == StepResult::Failed)
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        pretty_json(self)
    }
}

fn pretty_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string_pretty(value)
        .with_context(|| format!("[{}] Failed to serialize session", ErrorCode::SERIALIZATION_ERROR))
}
