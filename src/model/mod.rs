//! Core data model.
//!
//! Workflow runs, the jobs that drive them, and the events they emit.

pub mod event;
pub mod job;
pub mod run;

pub use event::{EventKind, EventRecord};
pub use job::{Backoff, JobId, JobOptions, JobPayload, JobState, NewJob, QueueJob, Retention};
pub use run::{RunLinks, WorkflowId, WorkflowRun};
