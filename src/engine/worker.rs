//! Worker pool: claims jobs per queue and runs them through their processor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use super::processor::{JobContext, JobError, Processor};
use crate::error::{Error, Result};
use crate::model::WorkflowId;
use crate::publisher::EventPublisher;
use crate::queue::{QueuePolicy, QueueRegistry};
use crate::store::{ClaimedJob, JobStore};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_job_span};
use crate::tracker::{WorkflowState, WorkflowStateTracker};
use opentelemetry::KeyValue;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Poll interval fallback when no wake-up arrives.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs before interrupting them.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs one claim loop per registered queue.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    events: EventPublisher,
    registry: Arc<QueueRegistry>,
    processors: HashMap<String, Arc<dyn Processor>>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: EventPublisher,
        registry: Arc<QueueRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            events,
            registry,
            processors: HashMap::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register the processor for `queue`. One per queue.
    pub fn register(&mut self, queue: &str, processor: impl Processor + 'static) -> Result<()> {
        self.registry.require(queue)?;
        if self.processors.contains_key(queue) {
            return Err(Error::Config(format!("queue {queue} already has a processor")));
        }
        self.processors.insert(queue.to_string(), Arc::new(processor));
        Ok(())
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    /// Token that stops the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal the pool to stop claiming and drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run every queue loop until shutdown, then drain in-flight jobs.
    pub async fn run(self) -> Result<()> {
        if self.processors.is_empty() {
            return Err(Error::Config("no processors registered".to_string()));
        }
        let pool = Arc::new(self);
        let mut loops = JoinSet::new();
        for queue in pool.processors.keys() {
            let policy = pool.registry.require(queue)?.clone();
            let pool = Arc::clone(&pool);
            loops.spawn(async move { pool.queue_loop(policy).await });
        }

        let mut first_error = None;
        while let Some(joined) = loops.join_next().await {
            let outcome = joined.map_err(|e| Error::Other(format!("queue loop panicked: {e}")));
            if let Err(e) = outcome.and_then(|r| r) {
                error!(error = %e, "queue loop failed");
                // One queue failing takes the rest down with it.
                pool.shutdown.cancel();
                first_error.get_or_insert(e);
            }
        }
        info!("worker pool stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Claim and run at most one job on `queue`. Returns whether one ran.
    pub async fn process_next(&self, queue: &str) -> Result<bool> {
        let policy = self.registry.require(queue)?;
        match self.store.claim(queue, policy.visibility_timeout()).await? {
            Some(claim) => {
                self.execute(claim, policy, CancellationToken::new()).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_loop(self: Arc<Self>, policy: QueuePolicy) -> Result<()> {
        let queue = policy.name.clone();
        self.store.create_queue(&queue).await?;

        let slots = Arc::new(Semaphore::new(policy.concurrency));
        let interrupt = CancellationToken::new();
        let policy = Arc::new(policy);
        let mut in_flight = JoinSet::new();

        info!(queue = %queue, concurrency = policy.concurrency, "queue worker started");

        loop {
            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    error!(queue = %queue, error = %e, "job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => permit
                    .map_err(|e| Error::Other(format!("queue slots closed: {e}")))?,
            };

            match self.store.claim(&queue, policy.visibility_timeout()).await {
                Ok(Some(claim)) => {
                    let pool = Arc::clone(&self);
                    let policy = Arc::clone(&policy);
                    let interrupt = interrupt.clone();
                    in_flight.spawn(async move {
                        pool.execute(claim, &policy, interrupt).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        woke = self.store.wait_for_jobs(&queue, self.config.poll_interval) => {
                            if let Err(e) = woke {
                                warn!(queue = %queue, error = %e, "waiting for jobs failed, polling");
                                tokio::time::sleep(self.config.poll_interval).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(queue = %queue, error = %e, "claim failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        self.drain(&queue, in_flight, interrupt).await;
        Ok(())
    }

    /// Wait for in-flight jobs; interrupt whatever is left after the timeout.
    async fn drain(&self, queue: &str, mut in_flight: JoinSet<()>, interrupt: CancellationToken) {
        if in_flight.is_empty() {
            info!(queue, "queue worker stopped");
            return;
        }
        info!(queue, in_flight = in_flight.len(), "waiting for in-flight jobs");
        let finished = tokio::time::timeout(self.config.shutdown_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(queue, remaining = in_flight.len(), "shutdown timeout, interrupting jobs");
            interrupt.cancel();
            while in_flight.join_next().await.is_some() {}
        }
        info!(queue, "queue worker stopped");
    }

    /// Run one claimed job to a settled outcome. Errors are logged here.
    async fn execute(&self, claim: ClaimedJob, policy: &QueuePolicy, interrupt: CancellationToken) {
        let span = start_job_span(&claim.job);
        async {
            record_state_transition(&span, "queued", "active");
            let job = &claim.job;

            // Redelivered after a crash with nothing left to spend.
            if job.attempts > job.opts.attempts {
                let reason = format!(
                    "attempts exhausted ({} of {}) after redelivery",
                    job.attempts - 1,
                    job.opts.attempts
                );
                self.fail(&claim, &reason, &span).await;
                return;
            }

            let Some(processor) = self.processors.get(&job.queue).cloned() else {
                self.fail(&claim, &format!("no processor for queue {}", job.queue), &span)
                    .await;
                return;
            };

            let ctx = JobContext {
                job: job.clone(),
                events: self.events.clone(),
                interrupt: interrupt.clone(),
            };
            let start = Instant::now();
            let outcome = self
                .run_with_heartbeat(processor.as_ref(), &ctx, &claim, policy.visibility_timeout())
                .await;
            let duration_ms = start.elapsed().as_millis() as u64;
            metrics::operation_duration_ms().record(
                duration_ms as f64,
                &[KeyValue::new("operation", "job.execute")],
            );

            match outcome {
                Ok(result) => {
                    self.close_run(&job.workflow_id, result).await;
                    record_state_transition(&span, "active", "completed");
                    info!(duration_ms, "job completed");
                    if let Err(e) = self.store.complete(&claim, job.opts.remove_on_complete).await {
                        error!(error = %e, "settling completed job errored");
                    }
                }
                Err(e) if e.is_retryable() && job.opts.can_retry(job.attempts) => {
                    let delay = job.opts.backoff.delay_for(job.attempts);
                    record_state_transition(&span, "active", "queued");
                    warn!(error = %e, duration_ms, retry_in_ms = delay.as_millis() as u64, "job attempt failed, retrying");
                    if let Err(e) = self.store.retry(&claim, delay, &e.to_string()).await {
                        error!(error = %e, "scheduling retry failed");
                    }
                }
                Err(e) => {
                    let reason = match &e {
                        JobError::Permanent(_) => e.to_string(),
                        _ => format!("{e} (after {} attempts)", job.attempts),
                    };
                    self.fail(&claim, &reason, &span).await;
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Drive the processor, pushing the job's visibility out every half
    /// period so a live job is not redelivered.
    async fn run_with_heartbeat(
        &self,
        processor: &dyn Processor,
        ctx: &JobContext,
        claim: &ClaimedJob,
        visibility: Duration,
    ) -> std::result::Result<serde_json::Value, JobError> {
        let work = processor.process(ctx);
        tokio::pin!(work);
        let mut beat = tokio::time::interval(visibility / 2);
        beat.tick().await;
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = ctx.interrupt.cancelled() => return Err(JobError::Interrupted),
                _ = beat.tick() => {
                    if let Err(e) = self.store.extend(claim, visibility).await {
                        warn!(error = %e, "extending job visibility failed");
                    }
                }
            }
        }
    }

    /// Append `workflow.completed` unless the processor already did.
    async fn close_run(&self, workflow_id: &WorkflowId, result: serde_json::Value) {
        let tracker = WorkflowStateTracker::new(self.events.log());
        match tracker.current_state(workflow_id).await {
            Ok(WorkflowState::Completed) => {}
            Ok(_) => {
                let result = (!result.is_null()).then_some(result);
                if let Err(e) = self.events.workflow_completed(workflow_id, None, result).await {
                    error!(error = %e, "recording workflow completion failed");
                }
            }
            Err(e) => warn!(error = %e, "reading run state failed, not closing run"),
        }
    }

    /// Terminal failure: the run's log gets a `workflow.error` before the
    /// job is settled. If the event cannot be written the job is left
    /// active, so its redelivery retries the terminal path.
    async fn fail(&self, claim: &ClaimedJob, reason: &str, span: &tracing::Span) {
        let job = &claim.job;
        if let Err(e) = self.events.workflow_error(&job.workflow_id, reason).await {
            error!(error = %e, "recording workflow error failed, leaving job for redelivery");
            return;
        }
        record_state_transition(span, "active", "failed");
        error!(reason, attempts = job.attempts, "job failed");
        if let Err(e) = self.store.fail(claim, reason, job.opts.remove_on_fail).await {
            error!(error = %e, "settling failed job errored");
        }
    }
}
