//! # Progress Reporting
//!
//! Live stream of completed steps. The pipeline calls the observer exactly
//! once per sealed step (redirect hops included), in execution order.
//!
//! Observers must not break the run: a panicking observer is caught and
//! logged, and the step is still recorded in the session.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use crate::session::TestStep;
use crate::telemetry::step_attributes;

/// Sink for completed steps.
pub trait ProgressObserver: Send + Sync {
    fn on_step(&self, step: &TestStep);
}

impl<F> ProgressObserver for F
where
    F: Fn(&TestStep) + Send + Sync,
{
    fn on_step(&self, step: &TestStep) {
        self(step)
    }
}

/// Delivers `step` to `observer`, containing any panic.
pub(crate) fn notify(observer: &dyn ProgressObserver, step: &TestStep) {
    if catch_unwind(AssertUnwindSafe(|| observer.on_step(step))).is_err() {
        error!(step = %step.name(), "Progress observer panicked; step kept");
    }
}

/// Logs every step through `tracing`, with its telemetry attributes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_step(&self, step: &TestStep) {
        let attributes = step_attributes(step)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");

        if step.succeeded() {
            info!(step = %step.name(), duration_ms = step.duration_ms(), %attributes, "✅ Step succeeded");
        } else {
            warn!(
                step = %step.name(),
                duration_ms = step.duration_ms(),
                error = step.error().unwrap_or_default(),
                %attributes,
                "❌ Step failed"
            );
        }
    }
}

/// Forwards copies of every step into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: UnboundedSender<TestStep>,
}

impl ChannelObserver {
    /// Observer plus the receiving end of its stream.
    pub fn new() -> (Self, UnboundedReceiver<TestStep>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_step(&self, step: &TestStep) {
        // receiver gone: nobody is listening any more
        let _ = self.sender.send(step.clone());
    }
}
