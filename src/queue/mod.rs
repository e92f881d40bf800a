//! Job queue: the single entry point for launching workflow runs.
//!
//! `enqueue` records the job and its run durably and returns at once; the
//! worker pool picks it up later, possibly in another process.

pub mod registry;

pub use registry::{CommandConfig, QueuePolicy, QueueRegistry, validate_queue_name};

use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::model::{Backoff, JobId, JobPayload, NewJob, QueueJob, RunLinks, WorkflowId, WorkflowRun};
use crate::store::JobStore;

/// Per-call overrides for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Run id to use; a fresh one is generated if absent.
    pub workflow_id: Option<WorkflowId>,
    pub actor: Option<String>,
    pub links: RunLinks,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
}

impl EnqueueOptions {
    pub fn workflow_id(mut self, id: impl Into<WorkflowId>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn links(mut self, links: RunLinks) -> Self {
        self.links = links;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    registry: Arc<QueueRegistry>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<QueueRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    /// Create every registered queue in the store (idempotent).
    pub async fn ensure_queues(&self) -> Result<()> {
        for policy in self.registry.iter() {
            self.store.create_queue(&policy.name).await?;
        }
        Ok(())
    }

    /// Record a job on `queue` and return it without waiting for execution.
    ///
    /// Unknown queues fail fast with [`crate::error::Error::UnknownQueue`].
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<QueueJob> {
        let policy = self.registry.require(queue)?;

        let mut opts = policy.job_options();
        if let Some(attempts) = options.attempts {
            opts.attempts = attempts.max(1);
        }
        if let Some(backoff) = options.backoff {
            opts.backoff = backoff;
        }

        let workflow_id = options.workflow_id.unwrap_or_else(WorkflowId::generate);
        let mut run = WorkflowRun::new(workflow_id);
        run.workflow_name = Some(payload.name.clone());
        run.actor = options.actor;
        run.links = options.links;

        let job = self
            .store
            .enqueue(NewJob {
                id: JobId::new(),
                queue: queue.to_string(),
                payload,
                opts,
                run,
            })
            .await?;

        info!(
            job_id = %job.id,
            queue,
            workflow_id = %job.workflow_id,
            name = %job.payload.name,
            "job enqueued"
        );
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<QueueJob> {
        self.store.get_job(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::JobState;
    use crate::store::{EventLog, MemoryStore};
    use serde_json::json;

    fn queue(store: Arc<MemoryStore>) -> JobQueue {
        let registry = QueueRegistry::empty()
            .with(QueuePolicy::new("workflow-jobs").attempts(5))
            .unwrap();
        JobQueue::new(store, Arc::new(registry))
    }

    #[tokio::test]
    async fn enqueue_records_job_and_run() {
        let store = Arc::new(MemoryStore::new());
        let jobs = queue(store.clone());
        let job = jobs
            .enqueue(
                "workflow-jobs",
                JobPayload::new("resolveIssue", json!({"issueNumber": 5})),
                EnqueueOptions::default().workflow_id("w1").actor("octocat"),
            )
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.opts.attempts, 5);
        assert_eq!(job.workflow_id, WorkflowId::from("w1"));

        let run = store.run(&"w1".into()).await.unwrap().unwrap();
        assert_eq!(run.workflow_name.as_deref(), Some("resolveIssue"));
        assert_eq!(run.actor.as_deref(), Some("octocat"));
    }

    #[tokio::test]
    async fn per_job_overrides_win() {
        let jobs = queue(Arc::new(MemoryStore::new()));
        let job = jobs
            .enqueue(
                "workflow-jobs",
                JobPayload::new("review", json!({})),
                EnqueueOptions::default()
                    .attempts(1)
                    .backoff(Backoff::Fixed { delay: 10 }),
            )
            .await
            .unwrap();
        assert_eq!(job.opts.attempts, 1);
        assert_eq!(job.opts.backoff, Backoff::Fixed { delay: 10 });
    }

    #[tokio::test]
    async fn unknown_queue_fails_fast() {
        let jobs = queue(Arc::new(MemoryStore::new()));
        let err = jobs
            .enqueue("nope", JobPayload::new("x", json!({})), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownQueue(_)));
    }
}
