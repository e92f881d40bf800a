//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.set_vt, pgmq.archive, pgmq.delete. Each takes any executor so the
//! job store can run them inside its own transactions.

use opentelemetry::KeyValue;
use sqlx::{Executor, Postgres};
use std::time::Duration;

use crate::error::Result;
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

/// pgmq counts visibility in whole seconds; round up so a delay is never
/// shortened, and never hide for less than a second.
pub fn vt_seconds(d: Duration) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.clamp(1, i32::MAX as u64) as i32
}

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Create a pgmq queue (idempotent).
pub async fn create<'e, E>(exec: E, queue: &str) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("SELECT pgmq.create($1)")
        .bind(queue)
        .execute(exec)
        .await?;
    record(queue, "create");
    Ok(())
}

/// Send a message. Returns the message ID.
pub async fn send<'e, E>(exec: E, queue: &str, payload: &serde_json::Value, delay_seconds: i32) -> Result<i64>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
        .bind(queue)
        .bind(payload)
        .bind(delay_seconds)
        .fetch_one(exec)
        .await?;
    record(queue, "send");
    Ok(row.0)
}

/// Read the next visible message, hiding it for `vt_seconds`.
/// Returns None if nothing is visible.
pub async fn read<'e, E>(exec: E, queue: &str, vt_seconds: i32) -> Result<Option<PgmqMessage>>
where
    E: Executor<'e, Database = Postgres>,
{
    let row = sqlx::query_as::<
        _,
        (
            i64,
            i32,
            chrono::DateTime<chrono::Utc>,
            chrono::DateTime<chrono::Utc>,
            serde_json::Value,
        ),
    >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
    .bind(queue)
    .bind(vt_seconds)
    .fetch_optional(exec)
    .await?;

    let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
        msg_id,
        read_ct,
        enqueued_at,
        vt,
        message,
    });
    record(queue, if msg.is_some() { "read" } else { "read_empty" });
    Ok(msg)
}

/// Make a message invisible for `vt_seconds` from now.
pub async fn set_vt<'e, E>(exec: E, queue: &str, msg_id: i64, vt_seconds: i32) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
        .bind(queue)
        .bind(msg_id)
        .bind(vt_seconds)
        .fetch_optional(exec)
        .await?;
    record(queue, "set_vt");
    Ok(())
}

/// Archive a message (moves to archive table, preserves for audit).
pub async fn archive<'e, E>(exec: E, queue: &str, msg_id: i64) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("SELECT pgmq.archive($1, $2)")
        .bind(queue)
        .bind(msg_id)
        .execute(exec)
        .await?;
    record(queue, "archive");
    Ok(())
}

/// Delete a message permanently.
pub async fn delete<'e, E>(exec: E, queue: &str, msg_id: i64) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("SELECT pgmq.delete($1, $2)")
        .bind(queue)
        .bind(msg_id)
        .execute(exec)
        .await?;
    record(queue, "delete");
    Ok(())
}
