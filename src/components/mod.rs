//! # Test Components
//!
//! A component is one unit of work in a pipeline: an **action** (DNS lookup,
//! reachability check, HTTP or browser request) that produces data, or a
//! **validation** that asserts on data produced earlier.
//!
//! Components are registered once and reused for every run, so they keep no
//! per-run state of their own. Everything a run produces goes through the
//! [`ExecutionContext`]: properties written with [`ExecutionContext::set`]
//! land in the bag of the step being built, and later components read them
//! back with [`ExecutionContext::find`].
//!
//! ## Error contract
//!
//! - Expected failures (validation mismatch, timeout, unreachable host, ...)
//!   are reported with [`ExecutionContext::fail`] and `Ok(())` is returned.
//! - `Err(_)` means something unexpected happened. The pipeline records the
//!   step as failed and marks the whole session as `Failed`.

pub mod dns;
pub mod reachability;
pub mod validation;

pub use dns::DnsResolution;
pub use reachability::ReachabilityCheck;
pub use validation::Validator;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::TestSettings;
use crate::errors::StructuredError;
use crate::progress::{notify, ProgressObserver};
use crate::properties::{FromProperty, PropertyBag, PropertyValue};
use crate::session::{StepKind, TestSession, TestSessionBuilder, TestStep};

/// Contract every pipeline component implements.
#[async_trait]
pub trait TestComponent: Send + Sync {
    /// Step name recorded in the session.
    fn name(&self) -> &str;

    fn kind(&self) -> StepKind;

    /// Failures of this component are expected: they neither halt the
    /// pipeline nor invalidate the session.
    fn tolerates_failure(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()>;
}

/// Whether the run produces a reported session or only checks wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Run,
    Probe,
}

#[derive(Debug)]
struct CurrentComponent {
    name: String,
    kind: StepKind,
    index: usize,
    tolerates_failure: bool,
}

// ============================================================================
// EXECUTION CONTEXT
// ============================================================================

/// Per-call state of one `run`/`probe`. Never shared between calls, even when
/// the pipeline itself is.
pub struct ExecutionContext {
    url: Url,
    settings: Arc<TestSettings>,
    cancellation: CancellationToken,
    mode: ExecutionMode,
    agent: String,
    builder: TestSessionBuilder,
    observer: Option<Arc<dyn ProgressObserver>>,
    current: Option<CurrentComponent>,
}

impl ExecutionContext {
    /// Fresh context with an initiated session.
    pub fn new(
        url: Url,
        settings: Arc<TestSettings>,
        cancellation: CancellationToken,
        mode: ExecutionMode,
        agent: &str,
    ) -> Self {
        let mut builder = TestSessionBuilder::new();
        builder.initiate(url.as_str(), Utc::now(), agent);
        Self {
            url,
            settings,
            cancellation,
            mode,
            agent: agent.to_string(),
            builder,
            observer: None,
            current: None,
        }
    }

    /// Reports every sealed step to `observer`. Ignored in probe mode.
    pub fn with_observer(mut self, observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        if self.mode == ExecutionMode::Run {
            self.observer = observer;
        }
        self
    }

    // ------------------------------------------------------------------------
    // Read access for components
    // ------------------------------------------------------------------------

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn settings(&self) -> &TestSettings {
        &self.settings
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Steps sealed so far in this run.
    pub fn steps(&self) -> &[TestStep] {
        self.builder.steps()
    }

    /// First value stored under `key`, searching sealed steps in execution
    /// order and then the step under construction.
    pub fn find<T: FromProperty>(&self, key: &str) -> Option<T> {
        self.bags().find_map(|bag| bag.get::<T>(key))
    }

    /// Most recently stored value under `key`.
    pub fn find_last<T: FromProperty>(&self, key: &str) -> Option<T> {
        self.bags().rev().find_map(|bag| bag.get::<T>(key))
    }

    /// First in-memory handle stored under `key`.
    pub fn find_handle<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.bags().find_map(|bag| bag.get_handle::<T>(key))
    }

    /// Most recently stored in-memory handle under `key`.
    pub fn find_last_handle<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.bags().rev().find_map(|bag| bag.get_handle::<T>(key))
    }

    fn bags(&self) -> impl DoubleEndedIterator<Item = &PropertyBag> {
        self.builder
            .steps()
            .iter()
            .map(TestStep::properties)
            .chain(self.builder.staged_properties())
    }

    // ------------------------------------------------------------------------
    // Write access for components
    // ------------------------------------------------------------------------

    /// Stores a property on the step being built; overwrites within the step.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.builder.build_property(key, value);
    }

    pub fn set_handle<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.builder.build_property(key, PropertyValue::NonSerializable(Arc::new(value)));
    }

    pub fn set_shared_handle<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.builder.build_property(key, PropertyValue::NonSerializable(value));
    }

    /// Marks the step being built as failed. The first failure is kept.
    pub fn fail(&mut self, error: impl Into<StructuredError>) {
        let error = error.into();
        debug!(error = %error, "Step failure reported");
        self.builder.fail_step(&error);
    }

    pub fn current_step_failed(&self) -> bool {
        self.builder.staged_failed()
    }

    /// Seals the current step and starts another one for the same component,
    /// named `"<component> (<label>)"`. Used for redirect hops.
    pub fn next_hop(&mut self, label: &str) -> Option<TestStep> {
        let sealed = self.seal_current();
        if let Some(current) = &self.current {
            let name = format!("{} ({})", current.name, label);
            self.builder.begin_step(&name, current.kind, current.index);
        }
        sealed
    }

    // ------------------------------------------------------------------------
    // Pipeline side
    // ------------------------------------------------------------------------

    pub(crate) fn begin_component(&mut self, index: usize, component: &dyn TestComponent) {
        self.current = Some(CurrentComponent {
            name: component.name().to_string(),
            kind: component.kind(),
            index,
            tolerates_failure: component.tolerates_failure(),
        });
        self.builder.begin_step(component.name(), component.kind(), index);
    }

    /// Seals the last step of the current component.
    pub(crate) fn complete_component(&mut self) -> Option<TestStep> {
        let sealed = self.seal_current();
        self.current = None;
        sealed
    }

    /// Records an unexpected fault on the current step and stops the session.
    pub(crate) fn fault(&mut self, error: &StructuredError) -> Option<TestStep> {
        let sealed = self.builder.build_fault(&self.agent, error);
        self.current = None;
        if let Some(step) = &sealed {
            self.report(step);
        }
        sealed
    }

    pub(crate) fn decline(&mut self, reason: &str) {
        self.builder.decline(reason);
    }

    pub(crate) fn finish(&mut self) -> TestSession {
        self.builder.finish()
    }

    fn seal_current(&mut self) -> Option<TestStep> {
        if self.current.as_ref().is_some_and(|c| c.tolerates_failure) {
            self.builder.ignore_step_failure();
        }
        let step = self.builder.build_step()?;
        self.report(&step);
        Some(step)
    }

    fn report(&self, step: &TestStep) {
        if let Some(observer) = &self.observer {
            notify(observer.as_ref(), step);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Small components shared by the pipeline and agent tests.

    use super::*;
    use crate::errors::ErrorCode;

    /// Writes one property, optionally failing.
    pub struct Emit {
        pub name: &'static str,
        pub key: &'static str,
        pub value: &'static str,
        pub fail: bool,
    }

    #[async_trait]
    impl TestComponent for Emit {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> StepKind {
            StepKind::Action
        }

        async fn execute(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            ctx.set(self.key, self.value);
            if self.fail {
                ctx.fail(StructuredError::new(ErrorCode::VALIDATION_FAILED, "told to fail"));
            }
            Ok(())
        }
    }

    pub fn emit(name: &'static str) -> Arc<dyn TestComponent> {
        Arc::new(Emit { name, key: "Emitted", value: name, fail: false })
    }

    pub fn failing(name: &'static str) -> Arc<dyn TestComponent> {
        Arc::new(Emit { name, key: "Emitted", value: name, fail: true })
    }

    /// Returns an unexpected error.
    pub struct Faulty;

    #[async_trait]
    impl TestComponent for Faulty {
        fn name(&self) -> &str {
            "Faulty"
        }

        fn kind(&self) -> StepKind {
            StepKind::Action
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            anyhow::bail!("collaborator exploded")
        }
    }

    /// Panics.
    pub struct Panicky;

    #[async_trait]
    impl TestComponent for Panicky {
        fn name(&self) -> &str {
            "Panicky"
        }

        fn kind(&self) -> StepKind {
            StepKind::Validation
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            panic!("component bug")
        }
    }

    pub fn context(url: &str) -> ExecutionContext {
        ExecutionContext::new(
            Url::parse(url).unwrap(),
            Arc::new(TestSettings::default()),
            CancellationToken::new(),
            ExecutionMode::Run,
            "unit",
        )
    }
}
