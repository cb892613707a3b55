//! # Pipeline
//!
//! An ordered list of [`TestComponent`]s executed one after another against
//! a single URL. Registration order is execution order: later components may
//! depend on properties written by earlier ones (reachability needs DNS,
//! validators need a response).
//!
//! ## Run state machine
//!
//! ```text
//! NotStarted ──▶ Running ──▶ Completed
//!     │             │
//!     ▼             ▼
//!  Declined       Failed
//! ```
//!
//! - A failed step halts the run unless `continue_on_failure` is set or the
//!   component tolerates its own failures.
//! - An `Err` or a panic out of a component is a fault: the step is failed,
//!   the session is marked `Failed` and nothing else runs.
//! - A cancellation observed between components faults the session with
//!   `E5004`; one observed before the first component declines it.
//!
//! The component list sits behind a lock so a shared pipeline can be mutated
//! while other calls run; each call works on a snapshot of the list.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use tracing::{error, info, info_span, warn, Instrument};

use crate::components::{ExecutionContext, ExecutionMode, TestComponent};
use crate::errors::{ErrorCode, StructuredError};
use crate::session::SessionState;

#[derive(Default)]
pub struct Pipeline {
    components: RwLock<Vec<Arc<dyn TestComponent>>>,
    continue_on_failure: AtomicBool,
}

/// How one component ended.
enum Outcome {
    Ran,
    Faulted(StructuredError),
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_continue_on_failure(continue_on_failure: bool) -> Self {
        let pipeline = Self::new();
        pipeline.set_continue_on_failure(continue_on_failure);
        pipeline
    }

    pub fn add_component(&self, component: Arc<dyn TestComponent>) {
        self.components
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(component);
    }

    /// Drops every registered component.
    pub fn clear(&self) {
        let mut components = self.components.write().unwrap_or_else(PoisonError::into_inner);
        components.clear();
        components.shrink_to_fit();
    }

    pub fn len(&self) -> usize {
        self.components.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn component_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|c| c.name().to_string()).collect()
    }

    pub fn continue_on_failure(&self) -> bool {
        self.continue_on_failure.load(Ordering::Relaxed)
    }

    pub fn set_continue_on_failure(&self, value: bool) {
        self.continue_on_failure.store(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Vec<Arc<dyn TestComponent>> {
        self.components.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Runs every component against `ctx`, recording one step per component
    /// (or per redirect hop). Returns how the run itself ended.
    pub async fn handle(&self, ctx: &mut ExecutionContext) -> SessionState {
        let components = self.snapshot();
        let continue_on_failure = self.continue_on_failure();

        if ctx.is_cancelled() {
            info!(url = %ctx.url(), "Run cancelled before start");
            ctx.decline("run cancelled before any component executed");
            return SessionState::Declined;
        }

        info!(url = %ctx.url(), components = components.len(), continue_on_failure, "🚀 Pipeline started");

        for (index, component) in components.iter().enumerate() {
            if let Outcome::Faulted(fault) = execute_one(ctx, index, component.as_ref()).await {
                error!(component = component.name(), error = %fault, "❌ Component faulted");
                ctx.fault(&fault);
                return SessionState::Failed;
            }

            let failed = ctx
                .steps()
                .iter()
                .rev()
                .take_while(|step| step.component_index() == index)
                .any(|step| step.counts_as_failure());

            if ctx.is_cancelled() {
                let cancelled = StructuredError::new(
                    ErrorCode::CANCELLED,
                    format!("run cancelled during '{}'", component.name()),
                )
                .with_url(ctx.url().as_str());
                warn!(component = component.name(), "Run cancelled");
                ctx.fault(&cancelled);
                return SessionState::Failed;
            }

            if failed && !continue_on_failure {
                warn!(component = component.name(), index, "Step failed, halting pipeline");
                return SessionState::Failed;
            }
            if failed {
                info!(component = component.name(), index, "Step failed, continuing");
            }
        }

        info!(url = %ctx.url(), "✅ Pipeline completed");
        SessionState::Completed
    }

    /// Runs every component in probe mode. `true` only when none returned an
    /// error, panicked or was cancelled; failed validations still count as a
    /// successful probe.
    pub async fn probe(&self, ctx: &mut ExecutionContext) -> bool {
        debug_assert_eq!(ctx.mode(), ExecutionMode::Probe);
        for (index, component) in self.snapshot().iter().enumerate() {
            if ctx.is_cancelled() {
                return false;
            }
            if let Outcome::Faulted(fault) = execute_one(ctx, index, component.as_ref()).await {
                warn!(component = component.name(), error = %fault, "Probe failed");
                return false;
            }
        }
        !ctx.is_cancelled()
    }
}

async fn execute_one(ctx: &mut ExecutionContext, index: usize, component: &dyn TestComponent) -> Outcome {
    ctx.begin_component(index, component);
    let span = info_span!("component", name = component.name(), kind = %component.kind(), index);

    let result = AssertUnwindSafe(component.execute(ctx))
        .catch_unwind()
        .instrument(span)
        .await;

    match result {
        Ok(Ok(())) => {
            ctx.complete_component();
            Outcome::Ran
        }
        Ok(Err(err)) => Outcome::Faulted(StructuredError::new(
            ErrorCode::COMPONENT_FAULT,
            format!("component '{}' failed unexpectedly: {:#}", component.name(), err),
        )),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Outcome::Faulted(StructuredError::new(
                ErrorCode::COMPONENT_PANIC,
                format!("component '{}' panicked: {}", component.name(), detail),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::{context, emit, failing, Faulty, Panicky};
    use crate::config::TestSettings;
    use crate::session::{StepResult, TestStep};
    use tokio_util::sync::CancellationToken;
    use url::Url;

    #[tokio::test]
    async fn test_steps_follow_registration_order() {
        let pipeline = Pipeline::new();
        for name in ["first", "second", "third"] {
            pipeline.add_component(emit(name));
        }
        let mut ctx = context("https://example.test/");

        assert_eq!(pipeline.handle(&mut ctx).await, SessionState::Completed);
        let session = ctx.finish();
        let names: Vec<&str> = session.steps().iter().map(TestStep::name).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_failure_halts_by_default() {
        let pipeline = Pipeline::new();
        pipeline.add_component(emit("one"));
        pipeline.add_component(failing("two"));
        pipeline.add_component(emit("three"));
        let mut ctx = context("https://example.test/");

        assert_eq!(pipeline.handle(&mut ctx).await, SessionState::Failed);
        let session = ctx.finish();
        assert_eq!(session.steps().len(), 2);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.validity());
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_everything() {
        let pipeline = Pipeline::with_continue_on_failure(true);
        pipeline.add_component(emit("one"));
        pipeline.add_component(failing("two"));
        pipeline.add_component(emit("three"));
        let mut ctx = context("https://example.test/");

        assert_eq!(pipeline.handle(&mut ctx).await, SessionState::Completed);
        let session = ctx.finish();
        assert_eq!(session.steps().len(), 3);
        assert_eq!(session.steps()[1].result(), StepResult::Failed);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_error_becomes_fault() {
        let pipeline = Pipeline::with_continue_on_failure(true);
        pipeline.add_component(emit("one"));
        pipeline.add_component(Arc::new(Faulty));
        pipeline.add_component(emit("never"));
        let mut ctx = context("https://example.test/");

        assert_eq!(pipeline.handle(&mut ctx).await, SessionState::Failed);
        let session = ctx.finish();
        assert_eq!(session.steps().len(), 2);
        assert_eq!(session.steps()[1].error_code(), Some("E5001"));
        assert!(session.error().unwrap().contains("collaborator exploded"));
    }

    #[tokio::test]
    async fn test_panic_becomes_fault() {
        let pipeline = Pipeline::new();
        pipeline.add_component(Arc::new(Panicky));
        let mut ctx = context("https://example.test/");

        assert_eq!(pipeline.handle(&mut ctx).await, SessionState::Failed);
        let session = ctx.finish();
        assert_eq!(session.steps()[0].error_code(), Some("E5002"));
        assert!(session.error().unwrap().contains("component bug"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_declined() {
        let pipeline = Pipeline::new();
        pipeline.add_component(emit("one"));
        let token = CancellationToken::new();
        token.cancel();
        let mut ctx = ExecutionContext::new(
            Url::parse("https://example.test/").unwrap(),
            Arc::new(TestSettings::default()),
            token,
            ExecutionMode::Run,
            "unit",
        );

        assert_eq!(pipeline.handle(&mut ctx).await, SessionState::Declined);
        let session = ctx.finish();
        assert!(session.steps().is_empty());
        assert_eq!(session.state(), SessionState::Declined);
    }

    #[tokio::test]
    async fn test_probe_ignores_validation_failures_but_not_faults() {
        let probe_ctx = || {
            ExecutionContext::new(
                Url::parse("https://example.test/").unwrap(),
                Arc::new(TestSettings::default()),
                CancellationToken::new(),
                ExecutionMode::Probe,
                "unit",
            )
        };

        let pipeline = Pipeline::new();
        pipeline.add_component(failing("validation"));
        assert!(pipeline.probe(&mut probe_ctx()).await);

        pipeline.add_component(Arc::new(Panicky));
        assert!(!pipeline.probe(&mut probe_ctx()).await);
    }

    #[test]
    fn test_clear_releases_components() {
        let pipeline = Pipeline::new();
        let component = emit("held");
        pipeline.add_component(component.clone());
        assert_eq!(Arc::strong_count(&component), 2);

        pipeline.clear();
        assert!(pipeline.is_empty());
        assert_eq!(Arc::strong_count(&component), 1);
    }
}
