//! Processors: what a worker runs for a claimed job.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{QueueJob, WorkflowId};
use crate::publisher::EventPublisher;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Why an attempt failed. Never escapes the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Worth another attempt if the policy allows one.
    #[error("{0}")]
    Retryable(String),

    /// Skip any remaining attempts.
    #[error("{0}")]
    Permanent(String),

    /// The worker shut down before the attempt finished.
    #[error("interrupted by worker shutdown")]
    Interrupted,
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        JobError::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        JobError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Permanent(_))
    }
}

impl From<crate::error::Error> for JobError {
    fn from(e: crate::error::Error) -> Self {
        JobError::Retryable(e.to_string())
    }
}

/// Everything a processor gets for one attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job: QueueJob,
    pub events: EventPublisher,
    /// Fired when the worker gives up waiting during shutdown.
    pub interrupt: CancellationToken,
}

impl JobContext {
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.job.workflow_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    pub fn data(&self) -> &Value {
        &self.job.payload.data
    }
}

/// Runs one attempt of a job.
///
/// `Ok` settles the job as completed. If the run's log does not already end
/// in `workflow.completed`, the pool appends one carrying the returned value,
/// so processors only need to emit it themselves to attach a summary.
/// Terminal failures get their `workflow.error` from the pool as well.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError>;
}

/// Adapts an async closure into a [`Processor`].
pub struct FnProcessor<F>(F);

pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    FnProcessor(f)
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError> {
        (self.0)(ctx.clone()).await
    }
}

/// Dispatches a job to the workflow named by its payload.
///
/// A name with no route is a permanent failure: retrying cannot fix it.
#[derive(Default)]
pub struct WorkflowRouter {
    routes: HashMap<String, Arc<dyn Processor>>,
}

impl WorkflowRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, name: impl Into<String>, workflow: impl Processor + 'static) -> Self {
        self.routes.insert(name.into(), Arc::new(workflow));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

#[async_trait]
impl Processor for WorkflowRouter {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let name = &ctx.job.payload.name;
        match self.routes.get(name) {
            Some(workflow) => workflow.process(ctx).await,
            None => {
                warn!(queue = %ctx.job.queue, name = %name, "no workflow registered for job");
                metrics::jobs_unroutable().add(
                    1,
                    &[
                        KeyValue::new("queue", ctx.job.queue.clone()),
                        KeyValue::new("name", name.clone()),
                    ],
                );
                Err(JobError::permanent(format!("unknown workflow: {name}")))
            }
        }
    }
}
