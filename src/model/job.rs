//! Queue job model.
//!
//! A job is one request to run a named workflow. It carries the workflow
//! name and parameters, its retry policy, and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::run::WorkflowId;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: JobId,

    /// Queue the job was enqueued on. Determines which processor runs it.
    pub queue: String,

    /// The workflow run this job drives.
    pub workflow_id: WorkflowId,

    /// Workflow name and parameters. Opaque to the queue.
    pub payload: JobPayload,

    /// Retry and retention policy, fixed at enqueue time.
    pub opts: JobOptions,

    /// Number of times the job has been claimed for execution.
    pub attempts: u32,

    pub state: JobState,

    /// Message of the most recent failed attempt.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What to run: the workflow name and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobPayload {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker, possibly delayed by a retry backoff.
    Queued,
    /// Claimed by a worker and executing.
    Active,
    /// Done successfully. Terminal.
    Completed,
    /// Exhausted retries or failed permanently. Terminal.
    Failed,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Active)
                | (Active, Active)      // redelivered after a worker crash
                | (Active, Completed)
                | (Active, Queued)      // retry with backoff
                | (Active, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(crate::error::Error::Other(format!("unknown job state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-job retry and retention options, persisted alongside the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Maximum number of execution attempts, including the first.
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { delay: 2000 },
            remove_on_complete: Retention::KeepLast(100),
            remove_on_fail: Retention::KeepLast(500),
        }
    }
}

impl JobOptions {
    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn can_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts
    }
}

/// Delay between attempts. `delay` is in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// `delay * 2^(attempts_made - 1)`.
    Exponential { delay: u64 },
    Fixed { delay: u64 },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts already ran.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => Duration::from_millis(delay),
            Backoff::Exponential { delay } => {
                let exp = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(delay.saturating_mul(1u64 << exp))
            }
        }
    }
}

/// What to do with a finished job record.
///
/// Serialized the way the job record stores it: `true` removes, `false`
/// keeps, a number keeps that many of the most recent records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RetentionRepr", into = "RetentionRepr")]
pub enum Retention {
    Keep,
    Remove,
    KeepLast(u32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetentionRepr {
    Flag(bool),
    Count(u32),
}

impl From<RetentionRepr> for Retention {
    fn from(r: RetentionRepr) -> Self {
        match r {
            RetentionRepr::Flag(true) => Retention::Remove,
            RetentionRepr::Flag(false) => Retention::Keep,
            RetentionRepr::Count(n) => Retention::KeepLast(n),
        }
    }
}

impl From<Retention> for RetentionRepr {
    fn from(r: Retention) -> Self {
        match r {
            Retention::Keep => RetentionRepr::Flag(false),
            Retention::Remove => RetentionRepr::Flag(true),
            Retention::KeepLast(n) => RetentionRepr::Count(n),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A fully-resolved job ready to be stored.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub queue: String,
    pub payload: JobPayload,
    pub opts: JobOptions,
    pub run: super::run::WorkflowRun,
}
