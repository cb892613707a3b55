//! Closure-based validation components.
//!
//! A [`Validator`] wraps a check closure over the execution context. Returning
//! `Err` fails the step with that error; the closure may also write
//! properties for later components.
//!
//! The stock constructors below cover HTTP semantics of the final response
//! (status, headers, body text). Richer content checks (HTML, rendered page,
//! certificates) plug in the same way.
//!
//! ```ignore
//! pipeline.add_component(Arc::new(Validator::success_status()));
//! pipeline.add_component(Arc::new(Validator::new("HasGreeting", |ctx| {
//!     let body: String = ctx.find_last(keys::HTTP_RESPONSE_CONTENT).unwrap_or_default();
//!     if body.contains("hello") { Ok(()) } else {
//!         Err(StructuredError::new(ErrorCode::CONTENT_MISMATCH, "no greeting"))
//!     }
//! })));
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use super::{ExecutionContext, TestComponent};
use crate::errors::{ErrorCode, StructuredError};
use crate::properties::keys;
use crate::senders::HttpResponse;
use crate::session::StepKind;

type Check = dyn Fn(&mut ExecutionContext) -> Result<(), StructuredError> + Send + Sync;

pub struct Validator {
    name: String,
    check: Box<Check>,
    tolerates_failure: bool,
}

impl Validator {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&mut ExecutionContext) -> Result<(), StructuredError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Box::new(check),
            tolerates_failure: false,
        }
    }

    /// Records failures without halting the pipeline or invalidating the session.
    pub fn tolerating_failure(mut self) -> Self {
        self.tolerates_failure = true;
        self
    }

    /// Final response status must be 2xx.
    pub fn success_status() -> Self {
        Self::new("SuccessStatus", |ctx| {
            let response = final_response(ctx)?;
            if (200..300).contains(&response.status) {
                Ok(())
            } else {
                Err(StructuredError::new(ErrorCode::UNEXPECTED_STATUS, "status is not successful")
                    .with_url(response.url.as_str())
                    .with_expectation("2xx", response.status.to_string()))
            }
        })
    }

    /// Final response status must be one of `codes`.
    pub fn status_code_in(codes: impl IntoIterator<Item = u16>) -> Self {
        let codes: Vec<u16> = codes.into_iter().collect();
        Self::new("StatusCode", move |ctx| {
            let response = final_response(ctx)?;
            if codes.contains(&response.status) {
                Ok(())
            } else {
                let expected = codes.iter().map(u16::to_string).collect::<Vec<_>>().join("|");
                Err(StructuredError::new(ErrorCode::UNEXPECTED_STATUS, "status not accepted")
                    .with_url(response.url.as_str())
                    .with_expectation(expected, response.status.to_string()))
            }
        })
    }

    /// Final response must carry header `name`.
    pub fn header_present(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(format!("Header[{}]", name), move |ctx| {
            let response = final_response(ctx)?;
            match response.header(&name) {
                Some(_) => Ok(()),
                None => Err(StructuredError::new(
                    ErrorCode::HEADER_MISSING,
                    format!("header '{}' missing", name),
                )
                .with_url(response.url.as_str())),
            }
        })
    }

    /// Final response body must contain `needle`.
    pub fn content_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new("ContentContains", move |ctx| {
            let response = final_response(ctx)?;
            if response.text().contains(needle.as_str()) {
                Ok(())
            } else {
                Err(StructuredError::new(
                    ErrorCode::CONTENT_MISMATCH,
                    format!("content does not contain '{}'", needle),
                )
                .with_url(response.url.as_str()))
            }
        })
    }

    /// Final response body must match `pattern`.
    pub fn content_matches(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern)?;
        Ok(Self::new("ContentMatches", move |ctx| {
            let response = final_response(ctx)?;
            if regex.is_match(&response.text()) {
                Ok(())
            } else {
                Err(StructuredError::new(
                    ErrorCode::CONTENT_MISMATCH,
                    format!("content does not match /{}/", regex.as_str()),
                )
                .with_url(response.url.as_str()))
            }
        }))
    }
}

/// Response of the last request sender that completed.
pub fn final_response(ctx: &ExecutionContext) -> Result<Arc<HttpResponse>, StructuredError> {
    ctx.find_last_handle::<HttpResponse>(keys::HTTP_RESPONSE_MESSAGE)
        .ok_or_else(|| {
            StructuredError::new(
                ErrorCode::MISSING_PREREQUISITE,
                "no response available; register a request sender before this validator",
            )
        })
}

#[async_trait]
impl TestComponent for Validator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Validation
    }

    fn tolerates_failure(&self) -> bool {
        self.tolerates_failure
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        if let Err(error) = (self.check)(ctx) {
            ctx.fail(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::context;
    use crate::session::StepResult;
    use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
    use url::Url;

    fn context_with_response(status: u16, body: &str) -> ExecutionContext {
        let mut ctx = context("https://example.test/");
        let sender = Validator::new("FakeSender", |_| Ok(()));
        ctx.begin_component(0, &sender);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        ctx.set_handle(
            keys::HTTP_RESPONSE_MESSAGE,
            HttpResponse {
                url: Url::parse("https://example.test/").unwrap(),
                status,
                headers,
                body: body.as_bytes().to_vec(),
            },
        );
        ctx.complete_component();
        ctx
    }

    async fn run(validator: &Validator, ctx: &mut ExecutionContext) -> crate::session::TestStep {
        ctx.begin_component(1, validator);
        validator.execute(ctx).await.unwrap();
        ctx.complete_component().unwrap()
    }

    #[tokio::test]
    async fn test_success_status() {
        let mut ctx = context_with_response(204, "");
        assert!(run(&Validator::success_status(), &mut ctx).await.succeeded());

        let mut ctx = context_with_response(503, "");
        let step = run(&Validator::success_status(), &mut ctx).await;
        assert_eq!(step.result(), StepResult::Failed);
        assert!(step.error().unwrap().contains("actual: 503"));
    }

    #[tokio::test]
    async fn test_status_code_in() {
        let mut ctx = context_with_response(301, "");
        assert!(run(&Validator::status_code_in([301, 302]), &mut ctx).await.succeeded());
        assert!(!run(&Validator::status_code_in([200]), &mut ctx).await.succeeded());
    }

    #[tokio::test]
    async fn test_header_and_content() {
        let mut ctx = context_with_response(200, "<h1>Welcome back</h1>");
        assert!(run(&Validator::header_present("content-type"), &mut ctx).await.succeeded());
        assert!(!run(&Validator::header_present("x-missing"), &mut ctx).await.succeeded());
        assert!(run(&Validator::content_contains("Welcome"), &mut ctx).await.succeeded());

        let matcher = Validator::content_matches(r"<h1>\w+ back</h1>").unwrap();
        assert!(run(&matcher, &mut ctx).await.succeeded());
        assert!(Validator::content_matches("(unclosed").is_err());
    }

    #[tokio::test]
    async fn test_missing_response_is_prerequisite_failure() {
        let mut ctx = context("https://example.test/");
        let step = run(&Validator::success_status(), &mut ctx).await;
        assert_eq!(step.error_code(), Some("E1003"));
    }

    #[tokio::test]
    async fn test_tolerated_failure_is_marked_ignored() {
        let mut ctx = context_with_response(500, "");
        let validator = Validator::success_status().tolerating_failure();
        let step = run(&validator, &mut ctx).await;
        assert_eq!(step.result(), StepResult::Failed);
        assert!(step.failure_ignored());
    }
}
