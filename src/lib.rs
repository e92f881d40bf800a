//! # runrelay
//!
//! Job queue, durable per-run event log, and live SSE delivery for
//! long-running workflow runs.
//!
//! Runs are launched through [`queue::JobQueue`] and executed by
//! [`engine::WorkerPool`]. Workflows report progress through
//! [`publisher::EventPublisher`], which appends to the run's log and fans
//! out on the live channel. Downstream readers use consumer groups
//! ([`consumer`]), the state tracker ([`tracker`]), or the SSE bridge
//! ([`sse`]). Postgres with pgmq backs everything ([`db`]); an in-memory
//! backend ([`store::MemoryStore`]) stands in for tests.

pub mod config;
pub mod consumer;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod model;
pub mod ports;
pub mod publisher;
pub mod queue;
pub mod shutdown;
pub mod sse;
pub mod store;
pub mod telemetry;
pub mod tracker;
