//! # webprobe
//!
//! Synthetic-monitoring engine: runs an ordered pipeline of network probes
//! (DNS resolution, reachability, HTTP or browser request with redirect
//! following) and validators against one URL, and returns a [`TestSession`]
//! describing every step.
//!
//! ```ignore
//! let agent = TestAgent::new(AgentConfig::default()).with_template(standard_template()?);
//! let session = agent.run("https://example.com/", TestSettings::default(), CancellationToken::new()).await;
//! println!("{}", session.to_json_pretty()?);
//! ```

pub mod agent;
pub mod components;
pub mod config;
pub mod errors;
pub mod loader;
pub mod pipeline;
pub mod progress;
pub mod properties;
pub mod senders;
pub mod session;
pub mod telemetry;

pub use agent::{standard_template, TestAgent, WorkerId};
pub use components::{ExecutionContext, ExecutionMode, TestComponent};
pub use config::{AgentConfig, RequestSettings, TestSettings};
pub use errors::{ErrorCode, RequestError, StructuredError};
pub use pipeline::Pipeline;
pub use progress::{ChannelObserver, ProgressObserver, TracingObserver};
pub use properties::{keys, PropertyBag, PropertyValue, SerializableValue};
pub use senders::{HttpRequestSender, HttpResponse, RequestSender};
pub use session::{SessionState, StepKind, StepResult, TestSession, TestSessionBuilder, TestStep};
