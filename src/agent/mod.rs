//! # Test Agent
//!
//! Top-level entry point. Binds pipelines, settings and an optional progress
//! observer into one callable unit:
//!
//! - [`TestAgent::run`] executes the pipeline and **always** returns a
//!   [`TestSession`]; bad input, component errors and panics all end up as a
//!   `Failed` session.
//! - [`TestAgent::probe`] checks the wiring in a throwaway context and
//!   returns a bool.
//! - [`TestAgent::cleanup`] empties the caller's pipeline between unrelated
//!   test cases.
//!
//! ## Pipeline scope
//!
//! With `instantiate_per_thread` (the default) every worker gets its own
//! [`Pipeline`], created on first use and populated by the agent's template.
//! Otherwise a single pipeline is shared by every caller; concurrent runs
//! still never share step data, since each call builds its own
//! [`ExecutionContext`].

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::components::{DnsResolution, ExecutionContext, ExecutionMode, ReachabilityCheck, Validator};
use crate::config::{AgentConfig, TestSettings};
use crate::errors::{ErrorCode, StructuredError};
use crate::pipeline::Pipeline;
use crate::progress::ProgressObserver;
use crate::senders::HttpRequestSender;
use crate::session::{TestSession, TestSessionBuilder};

// ============================================================================
// WORKER IDENTITY
// ============================================================================

/// Key of a per-worker pipeline. Defaults to the calling OS thread.
///
/// Per-worker pipelines live until [`TestAgent::cleanup_for`] or
/// [`TestAgent::cleanup_all`]; callers that spread work over short-lived
/// threads should clean up, or use named ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn current() -> Self {
        Self(format!("{:?}", std::thread::current().id()))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

enum PipelineScope {
    PerWorker(Mutex<HashMap<WorkerId, Arc<Pipeline>>>),
    Shared(Arc<Pipeline>),
}

type Template = dyn Fn(&Pipeline) + Send + Sync;

// ============================================================================
// AGENT
// ============================================================================

pub struct TestAgent {
    config: AgentConfig,
    scope: PipelineScope,
    template: Option<Arc<Template>>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl TestAgent {
    pub fn new(config: AgentConfig) -> Self {
        let scope = if config.instantiate_per_thread {
            PipelineScope::PerWorker(Mutex::new(HashMap::new()))
        } else {
            PipelineScope::Shared(Arc::new(Pipeline::with_continue_on_failure(config.continue_on_failure)))
        };
        Self {
            config,
            scope,
            template: None,
            observer: None,
        }
    }

    /// Populates every pipeline this agent creates. In shared mode the
    /// single pipeline is populated immediately.
    pub fn with_template<F>(mut self, template: F) -> Self
    where
        F: Fn(&Pipeline) + Send + Sync + 'static,
    {
        if let PipelineScope::Shared(pipeline) = &self.scope {
            template(pipeline);
        }
        self.template = Some(Arc::new(template));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Pipeline of the calling thread (or the shared one).
    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline_for(&WorkerId::current())
    }

    pub fn pipeline_for(&self, worker: &WorkerId) -> Arc<Pipeline> {
        match &self.scope {
            PipelineScope::Shared(pipeline) => pipeline.clone(),
            PipelineScope::PerWorker(pipelines) => {
                let mut pipelines = pipelines.lock().unwrap_or_else(PoisonError::into_inner);
                pipelines
                    .entry(worker.clone())
                    .or_insert_with(|| {
                        let pipeline = Pipeline::with_continue_on_failure(self.config.continue_on_failure);
                        if let Some(template) = &self.template {
                            template(&pipeline);
                        }
                        info!(agent = %self.config.name, worker = %worker, "Pipeline created for worker");
                        Arc::new(pipeline)
                    })
                    .clone()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Run / Probe / Cleanup
    // ------------------------------------------------------------------------

    /// Runs the calling worker's pipeline against `url`.
    pub async fn run(&self, url: &str, settings: TestSettings, cancellation: CancellationToken) -> TestSession {
        self.run_as(&WorkerId::current(), url, settings, cancellation).await
    }

    #[instrument(name = "agent_run", skip_all, fields(agent = %self.config.name, worker = %worker, url = url))]
    pub async fn run_as(
        &self,
        worker: &WorkerId,
        url: &str,
        settings: TestSettings,
        cancellation: CancellationToken,
    ) -> TestSession {
        let (url, settings) = match prepare(url, settings) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(error = %err, "Run rejected before start");
                return self.rejected_session(url, &err);
            }
        };

        let pipeline = self.pipeline_for(worker);
        let mut ctx = ExecutionContext::new(url, settings, cancellation, ExecutionMode::Run, &self.config.name)
            .with_observer(self.observer.clone());

        let handled = AssertUnwindSafe(pipeline.handle(&mut ctx)).catch_unwind().await;
        if handled.is_err() {
            let fault = StructuredError::new(ErrorCode::COMPONENT_PANIC, "pipeline panicked outside a component");
            error!(error = %fault, "❌ Pipeline panicked");
            ctx.fault(&fault);
        }

        let session = ctx.finish();
        info!(
            session = %session.id(),
            state = ?session.state(),
            validity = session.validity(),
            steps = session.steps().len(),
            duration_ms = session.duration_ms(),
            "Session finished"
        );
        session
    }

    /// Dry run of the calling worker's pipeline.
    pub async fn probe(&self, url: &str, settings: TestSettings, cancellation: CancellationToken) -> bool {
        self.probe_as(&WorkerId::current(), url, settings, cancellation).await
    }

    /// Dry run in a disposable context. `false` on bad input, any component
    /// error or panic, or cancellation.
    pub async fn probe_as(
        &self,
        worker: &WorkerId,
        url: &str,
        settings: TestSettings,
        cancellation: CancellationToken,
    ) -> bool {
        let Ok((url, settings)) = prepare(url, settings) else {
            return false;
        };
        let pipeline = self.pipeline_for(worker);
        let mut ctx = ExecutionContext::new(url, settings, cancellation, ExecutionMode::Probe, &self.config.name);

        match AssertUnwindSafe(pipeline.probe(&mut ctx)).catch_unwind().await {
            Ok(ok) => ok,
            Err(_) => {
                error!(agent = %self.config.name, worker = %worker, "Probe panicked");
                false
            }
        }
    }

    /// Removes every component from the calling worker's pipeline.
    pub fn cleanup(&self) {
        self.cleanup_for(&WorkerId::current());
    }

    /// Removes every component from `worker`'s pipeline. In per-worker mode
    /// the pipeline is also forgotten; the next use creates a fresh one from
    /// the template, so threads that come and go do not pile up pipelines.
    pub fn cleanup_for(&self, worker: &WorkerId) {
        match &self.scope {
            PipelineScope::Shared(pipeline) => pipeline.clear(),
            PipelineScope::PerWorker(pipelines) => {
                let removed = pipelines
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(worker);
                if let Some(pipeline) = removed {
                    pipeline.clear();
                }
            }
        }
    }

    /// Removes every component from every pipeline and forgets per-worker
    /// pipelines.
    pub fn cleanup_all(&self) {
        match &self.scope {
            PipelineScope::Shared(pipeline) => pipeline.clear(),
            PipelineScope::PerWorker(pipelines) => {
                let mut pipelines = pipelines.lock().unwrap_or_else(PoisonError::into_inner);
                for pipeline in pipelines.values() {
                    pipeline.clear();
                }
                pipelines.clear();
            }
        }
    }

    fn rejected_session(&self, url: &str, error: &StructuredError) -> TestSession {
        let mut builder = TestSessionBuilder::new();
        builder.initiate(url, Utc::now(), &self.config.name);
        builder.build_fault(&self.config.name, error);
        builder.finish()
    }
}

fn prepare(url: &str, settings: TestSettings) -> Result<(Url, Arc<TestSettings>), StructuredError> {
    let parsed = Url::parse(url).map_err(|e| {
        StructuredError::new(ErrorCode::INVALID_URL, format!("invalid URL: {}", e)).with_url(url)
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(StructuredError::new(
            ErrorCode::INVALID_URL,
            format!("unsupported scheme '{}'", parsed.scheme()),
        )
        .with_url(url));
    }
    Ok((parsed, Arc::new(settings.validated()?)))
}

/// DNS resolution, reachability, HTTP request and a 2xx status check: the
/// pipeline used by the command line.
pub fn standard_template() -> Result<impl Fn(&Pipeline) + Send + Sync + 'static, reqwest::Error> {
    let dns = Arc::new(DnsResolution::new());
    let reachability = Arc::new(ReachabilityCheck::new());
    let http = Arc::new(HttpRequestSender::new("HttpRequest")?);
    let status = Arc::new(Validator::success_status());

    Ok(move |pipeline: &Pipeline| {
        pipeline.add_component(dns.clone());
        pipeline.add_component(reachability.clone());
        pipeline.add_component(http.clone());
        pipeline.add_component(status.clone());
    })
}
