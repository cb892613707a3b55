use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SessionState, StepKind, StepResult, TestSession, TestStep};
use crate::errors::StructuredError;
use crate::properties::{PropertyBag, PropertyValue};

/// Step being assembled; sealed into a [`TestStep`] by `build_step`.
#[derive(Debug)]
struct StagedStep {
    name: String,
    kind: StepKind,
    component_index: usize,
    started_at: DateTime<Utc>,
    clock: Instant,
    properties: PropertyBag,
    failure: Option<StructuredError>,
    failure_ignored: bool,
}

/// Per-run state, reset by `initiate`.
#[derive(Debug)]
struct RunState {
    id: Uuid,
    agent: String,
    url: String,
    started_at: DateTime<Utc>,
    clock: Instant,
    steps: Vec<TestStep>,
    staged: Option<StagedStep>,
    /// Set by `build_fault`; no more steps are accepted afterwards.
    fault: Option<String>,
    declined: Option<String>,
    finished_ms: Option<u64>,
}

/// Accumulates steps into a [`TestSession`] across one pipeline run.
///
/// Lifecycle: `initiate` → (`begin_step` → `build_property`* → `build_step`)* → `finish`.
/// Calls made in the wrong order are logged and ignored; they never panic.
#[derive(Debug, Default)]
pub struct TestSessionBuilder {
    run: Option<RunState>,
}

impl TestSessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session, discarding everything from a previous run.
    pub fn initiate(&mut self, url: &str, started_at: DateTime<Utc>, agent: &str) {
        self.run = Some(RunState {
            id: Uuid::new_v4(),
            agent: agent.to_string(),
            url: url.to_string(),
            started_at,
            clock: Instant::now(),
            steps: Vec::new(),
            staged: None,
            fault: None,
            declined: None,
            finished_ms: None,
        });
    }

    /// Starts staging a step for the component at `component_index`.
    pub fn begin_step(&mut self, name: &str, kind: StepKind, component_index: usize) {
        let Some(run) = self.accepting_run() else {
            return;
        };
        if let Some(previous) = &run.staged {
            warn!(step = %previous.name, "Unsealed step replaced by a new one");
        }
        run.staged = Some(StagedStep {
            name: name.to_string(),
            kind,
            component_index,
            started_at: Utc::now(),
            clock: Instant::now(),
            properties: PropertyBag::new(),
            failure: None,
            failure_ignored: false,
        });
    }

    /// Stages a property on the step under construction.
    pub fn build_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        match self.staged_mut() {
            Some(staged) => staged.properties.set(key, value),
            None => debug!("Property dropped: no step is being built"),
        }
    }

    /// Marks the step under construction as failed. The first failure wins.
    pub fn fail_step(&mut self, error: &StructuredError) {
        if let Some(staged) = self.staged_mut() {
            if staged.failure.is_none() {
                staged.failure = Some(error.clone());
            }
        }
    }

    /// Declares a failure of the step under construction as expected.
    pub fn ignore_step_failure(&mut self) {
        if let Some(staged) = self.staged_mut() {
            staged.failure_ignored = true;
        }
    }

    pub fn staged_properties(&self) -> Option<&PropertyBag> {
        self.run
            .as_ref()
            .and_then(|run| run.staged.as_ref())
            .map(|staged| &staged.properties)
    }

    pub fn staged_failed(&self) -> bool {
        self.run
            .as_ref()
            .and_then(|run| run.staged.as_ref())
            .is_some_and(|staged| staged.failure.is_some())
    }

    /// Seals the staged step, appends it, and returns a copy for progress reporting.
    pub fn build_step(&mut self) -> Option<TestStep> {
        let Some(run) = self.accepting_run() else {
            return None;
        };
        let Some(staged) = run.staged.take() else {
            warn!("build_step called without a staged step");
            return None;
        };
        let step = seal(staged);
        run.steps.push(step.clone());
        Some(step)
    }

    /// Terminal failure: an unexpected fault escaped a component. Seals the staged
    /// step (if any) as failed and stops accepting steps.
    pub fn build_fault(&mut self, agent: &str, error: &StructuredError) -> Option<TestStep> {
        let Some(run) = self.accepting_run() else {
            return None;
        };
        let sealed = run.staged.take().map(|mut staged| {
            staged.failure = Some(error.clone());
            staged.failure_ignored = false;
            let step = seal(staged);
            run.steps.push(step.clone());
            step
        });
        warn!(agent = %agent, error = %error, "Session marked as failed");
        run.fault = Some(error.user_message());
        sealed
    }

    /// Marks the session as declined (nothing was executed).
    pub fn decline(&mut self, reason: &str) {
        if let Some(run) = self.accepting_run() {
            run.staged = None;
            run.declined = Some(reason.to_string());
        }
    }

    pub fn steps(&self) -> &[TestStep] {
        self.run.as_ref().map(|run| run.steps.as_slice()).unwrap_or(&[])
    }

    pub fn is_faulted(&self) -> bool {
        self.run.as_ref().is_some_and(|run| run.fault.is_some())
    }

    /// Snapshot of the session, finished or still in progress.
    pub fn test_session(&self) -> TestSession {
        match &self.run {
            Some(run) => snapshot(run),
            None => TestSession {
                id: Uuid::nil(),
                agent: String::new(),
                url: String::new(),
                started_at: Utc::now(),
                duration_ms: 0,
                state: SessionState::Declined,
                validity: false,
                error: Some("session was never initiated".to_string()),
                steps: Vec::new(),
            },
        }
    }

    /// Freezes the total duration and returns the final session.
    pub fn finish(&mut self) -> TestSession {
        if let Some(run) = self.run.as_mut() {
            if let Some(staged) = run.staged.take() {
                warn!(step = %staged.name, "Unsealed step discarded at finish");
            }
            if run.finished_ms.is_none() {
                run.finished_ms = Some(elapsed_ms(run.clock));
            }
        }
        self.test_session()
    }

    fn accepting_run(&mut self) -> Option<&mut RunState> {
        match self.run.as_mut() {
            None => {
                warn!("Session builder used before initiate");
                None
            }
            Some(run) if run.fault.is_some() || run.finished_ms.is_some() || run.declined.is_some() => {
                debug!("Session no longer accepts steps");
                None
            }
            Some(run) => Some(run),
        }
    }

    fn staged_mut(&mut self) -> Option<&mut StagedStep> {
        self.accepting_run().and_then(|run| run.staged.as_mut())
    }
}

fn seal(staged: StagedStep) -> TestStep {
    let (result, error, error_code) = match &staged.failure {
        Some(err) => (
            StepResult::Failed,
            Some(err.user_message()),
            Some(err.code.formatted()),
        ),
        None => (StepResult::Succeeded, None, None),
    };
    TestStep {
        name: staged.name,
        kind: staged.kind,
        component_index: staged.component_index,
        started_at: staged.started_at,
        duration_ms: elapsed_ms(staged.clock),
        result,
        error,
        error_code,
        failure_ignored: staged.failure_ignored && result == StepResult::Failed,
        properties: staged.properties,
    }
}

fn snapshot(run: &RunState) -> TestSession {
    let any_failure = run.steps.iter().any(TestStep::counts_as_failure);
    let state = if run.declined.is_some() {
        SessionState::Declined
    } else if run.fault.is_some() || any_failure {
        SessionState::Failed
    } else {
        SessionState::Completed
    };
    TestSession {
        id: run.id,
        agent: run.agent.clone(),
        url: run.url.clone(),
        started_at: run.started_at,
        duration_ms: run.finished_ms.unwrap_or_else(|| elapsed_ms(run.clock)),
        state,
        validity: state == SessionState::Completed,
        error: run.fault.clone().or_else(|| run.declined.clone()),
        steps: run.steps.clone(),
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    fn started() -> TestSessionBuilder {
        let mut builder = TestSessionBuilder::new();
        builder.initiate("https://example.test/", Utc::now(), "unit");
        builder
    }

    #[test]
    fn test_build_step_appends_in_order() {
        let mut builder = started();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            builder.begin_step(name, StepKind::Action, i);
            builder.build_property("index", i as i64);
            let step = builder.build_step().unwrap();
            assert_eq!(step.name(), *name);
        }

        let session = builder.finish();
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.validity());
        let indexes: Vec<_> = session.steps().iter().map(TestStep::component_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn test_initiate_resets_previous_run() {
        let mut builder = started();
        builder.begin_step("a", StepKind::Action, 0);
        builder.build_step();
        let first = builder.finish().id();

        builder.initiate("https://other.test/", Utc::now(), "unit");
        let session = builder.test_session();
        assert!(session.steps().is_empty());
        assert_ne!(session.id(), first);
        assert_eq!(session.url(), "https://other.test/");
    }

    #[test]
    fn test_fault_stops_accepting_steps() {
        let mut builder = started();
        builder.begin_step("boom", StepKind::Action, 0);
        let err = StructuredError::new(ErrorCode::COMPONENT_FAULT, "unexpected");
        let sealed = builder.build_fault("unit", &err).unwrap();
        assert_eq!(sealed.result(), StepResult::Failed);

        builder.begin_step("after", StepKind::Action, 1);
        assert!(builder.build_step().is_none());

        let session = builder.finish();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.steps().len(), 1);
        assert!(session.error().unwrap().contains("E5001"));
    }

    #[test]
    fn test_ignored_failure_keeps_validity() {
        let mut builder = started();
        builder.begin_step("flaky", StepKind::Validation, 0);
        builder.fail_step(&StructuredError::new(ErrorCode::VALIDATION_FAILED, "meh"));
        builder.ignore_step_failure();
        let step = builder.build_step().unwrap();
        assert!(step.failure_ignored());

        let session = builder.finish();
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.validity());
    }

    #[test]
    fn test_builder_misuse_is_harmless() {
        let mut builder = TestSessionBuilder::new();
        builder.build_property("k", "v");
        assert!(builder.build_step().is_none());
        assert_eq!(builder.test_session().state(), SessionState::Declined);

        let mut builder = started();
        assert!(builder.build_step().is_none());
        builder.decline("cancelled before start");
        let session = builder.finish();
        assert_eq!(session.state(), SessionState::Declined);
        assert!(!session.validity());
    }
}
