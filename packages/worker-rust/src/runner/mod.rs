//! Job runner contract.
//!
//! A [`JobRunner`] executes the work one message carries. It returns `Ok` on
//! success or a classified [`JobError`] on failure, and never touches the
//! queue lease: extension and resolution belong to the dispatcher.

pub mod command;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use workq_core::{AttributeValue, JobError, JobId, MessageId, QueueMessage};

use crate::lease::LeaseView;

pub use command::CommandRunner;

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

/// Everything a runner gets to know about the job it executes.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub message_id: MessageId,
    pub body: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Queue-reported receive count for this delivery, if exposed.
    pub delivery_count: Option<u32>,
    pub worker_name: String,
    /// Read-only view of the message lease.
    pub lease: LeaseView,
}

impl JobContext {
    /// Builds the context for one delivery of `message`.
    #[must_use]
    pub fn new(job_id: JobId, message: &QueueMessage, worker_name: impl Into<String>, lease: LeaseView) -> Self {
        Self {
            job_id,
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            attributes: message.attributes.clone(),
            delivery_count: message.delivery_count,
            worker_name: worker_name.into(),
            lease,
        }
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Executes one job.
///
/// Runners must be safe to call again for the same job: a delivery whose
/// lease lapsed can be processed twice.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Runs the job to completion.
    ///
    /// # Errors
    ///
    /// Returns a [`JobError`] tagged with the failure kind; the kind decides
    /// whether the message is retried.
    async fn run(&self, ctx: JobContext) -> Result<(), JobError>;
}

#[async_trait]
impl<R: JobRunner + ?Sized> JobRunner for Arc<R> {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        (**self).run(ctx).await
    }
}

/// Runner built from an async closure. See [`runner_fn`].
pub struct FnRunner<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnRunner<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnRunner").finish_non_exhaustive()
    }
}

/// Wraps an async closure as a [`JobRunner`].
pub fn runner_fn<F, Fut>(f: F) -> FnRunner<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    FnRunner { f }
}

#[async_trait]
impl<F, Fut> JobRunner for FnRunner<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.f)(ctx).await
    }
}

// ---------------------------------------------------------------------------
// RunnerRouter
// ---------------------------------------------------------------------------

/// Routes each job to a runner chosen by a message attribute.
///
/// Lookup order: exact attribute value, then `prefix.*` patterns, then the
/// fallback runner. A message with no route fails as a content error.
pub struct RunnerRouter {
    attribute: String,
    routes: HashMap<String, Arc<dyn JobRunner>>,
    fallback: Option<Arc<dyn JobRunner>>,
}

impl std::fmt::Debug for RunnerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<_> = self.routes.keys().collect();
        routes.sort();
        f.debug_struct("RunnerRouter")
            .field("attribute", &self.attribute)
            .field("routes", &routes)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl RunnerRouter {
    /// Creates a router keyed on the given message attribute.
    #[must_use]
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            routes: HashMap::new(),
            fallback: None,
        }
    }

    /// Registers `runner` for an attribute value or a `prefix.*` pattern.
    #[must_use]
    pub fn route(mut self, pattern: impl Into<String>, runner: impl JobRunner) -> Self {
        self.routes.insert(pattern.into(), Arc::new(runner));
        self
    }

    /// Runner used when no route matches.
    #[must_use]
    pub fn fallback(mut self, runner: impl JobRunner) -> Self {
        self.fallback = Some(Arc::new(runner));
        self
    }

    fn resolve(&self, ctx: &JobContext) -> Result<&Arc<dyn JobRunner>, JobError> {
        let Some(value) = ctx.attribute(&self.attribute).map(AttributeValue::as_text) else {
            return self.fallback.as_ref().ok_or_else(|| {
                JobError::content(format!("message has no {} attribute", self.attribute))
            });
        };

        if let Some(runner) = self.routes.get(value.as_str()) {
            return Ok(runner);
        }

        let by_prefix = self
            .routes
            .iter()
            .filter_map(|(pattern, runner)| {
                let prefix = pattern.strip_suffix(".*")?;
                value
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
                    .then_some((prefix.len(), runner))
            })
            // Longest prefix wins.
            .max_by_key(|(len, _)| *len)
            .map(|(_, runner)| runner);

        by_prefix
            .or(self.fallback.as_ref())
            .ok_or_else(|| JobError::content(format!("no runner registered for {} {value:?}", self.attribute)))
    }
}

#[async_trait]
impl JobRunner for RunnerRouter {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        let runner = Arc::clone(self.resolve(&ctx)?);
        runner.run(ctx).await
    }
}
