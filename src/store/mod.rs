//! Storage traits shared by the Postgres backend and the in-memory backend.
//!
//! Three concerns, three traits:
//! - [`JobStore`]: durable job records plus a visibility-timeout queue.
//! - [`EventLog`]: per-run append-only logs with consumer groups.
//! - [`LiveChannel`]: the shared fire-and-forget status channel.
//!
//! [`crate::db::Db`] implements all three over Postgres + pgmq;
//! [`memory::MemoryStore`] implements them in-process for tests and
//! single-process development.

pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::model::event::{EntryId, LogEntry};
use crate::model::{JobId, NewJob, QueueJob, Retention, WorkflowId, WorkflowRun};

pub use memory::MemoryStore;

/// Page size used when scanning a whole log.
const SCAN_PAGE: usize = 500;

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A job claimed by a worker, plus the queue receipt needed to settle it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: QueueJob,
    /// Queue message id. Hidden from other workers until its visibility
    /// timeout lapses.
    pub receipt: i64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a queue (idempotent).
    async fn create_queue(&self, queue: &str) -> Result<()>;

    /// Durably record a job and its run, and make it claimable.
    async fn enqueue(&self, job: NewJob) -> Result<QueueJob>;

    /// Claim the next visible job on `queue`, hiding it for `visibility`.
    ///
    /// Increments the attempt count and moves the job to `active`. Jobs
    /// whose previous worker vanished are claimable again once their
    /// visibility lapses.
    async fn claim(&self, queue: &str, visibility: Duration) -> Result<Option<ClaimedJob>>;

    /// Push the claimed job's visibility timeout out by `visibility`.
    async fn extend(&self, claim: &ClaimedJob, visibility: Duration) -> Result<()>;

    /// Mark the job completed and drop its queue message.
    async fn complete(&self, claim: &ClaimedJob, retention: Retention) -> Result<()>;

    /// Put the job back on the queue, invisible for `delay`.
    async fn retry(&self, claim: &ClaimedJob, delay: Duration, error: &str) -> Result<()>;

    /// Mark the job permanently failed and drop its queue message.
    async fn fail(&self, claim: &ClaimedJob, error: &str, retention: Retention) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<QueueJob>;

    /// Block until new work may be available on `queue`, or `timeout`.
    async fn wait_for_jobs(&self, queue: &str, timeout: Duration) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// A delivered-but-unacknowledged entry of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u32,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a serialized record to the run's log.
    ///
    /// When `max_len` is set the log is trimmed to roughly that many
    /// entries; trimming is approximate and may lag behind appends.
    async fn append(
        &self,
        log: &WorkflowId,
        payload: &str,
        max_len: Option<usize>,
    ) -> Result<EntryId>;

    /// Entries after `after` (exclusive), in append order.
    async fn read_range(
        &self,
        log: &WorkflowId,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Create a consumer group positioned at the start of the log.
    ///
    /// Returns `false` if the group already existed; its cursor is left
    /// untouched.
    async fn ensure_group(&self, log: &WorkflowId, group: &str) -> Result<bool>;

    /// Deliver up to `count` never-delivered entries to `consumer`,
    /// waiting up to `block` if none are available yet.
    ///
    /// Delivered entries stay pending until acknowledged.
    async fn read_group(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Transfer pending entries idle for at least `min_idle` to `consumer`
    /// and return them for redelivery.
    async fn claim_stale(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge entries, removing them from the pending set.
    async fn ack(&self, log: &WorkflowId, group: &str, ids: &[EntryId]) -> Result<u64>;

    async fn pending(&self, log: &WorkflowId, group: &str) -> Result<Vec<PendingEntry>>;

    async fn run(&self, id: &WorkflowId) -> Result<Option<WorkflowRun>>;

    /// The whole log in append order.
    async fn read_all(&self, log: &WorkflowId) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        let mut after = None;
        loop {
            let page = self.read_range(log, after, SCAN_PAGE).await?;
            let done = page.len() < SCAN_PAGE;
            after = page.last().map(|e| e.id).or(after);
            out.extend(page);
            if done {
                return Ok(out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Live channel
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Publish to every current subscriber. Never waits for subscribers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a dedicated subscription for one client.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>>;
}

/// Liveness check for whatever backs the stores.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> Result<()>;
}

/// A single client's subscription to a live channel.
#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` once the subscription has ended.
    async fn next_message(&mut self) -> Result<Option<String>>;

    async fn unsubscribe(&mut self) -> Result<()>;

    /// Release the underlying connection.
    async fn close(&mut self) -> Result<()>;
}
