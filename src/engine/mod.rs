//! Worker engine: processors and the pool that runs them.

pub mod command;
pub mod processor;
pub mod worker;

pub use command::CommandProcessor;
pub use processor::{FnProcessor, JobContext, JobError, Processor, WorkflowRouter, processor_fn};
pub use worker::{WorkerConfig, WorkerPool};
