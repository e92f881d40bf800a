//! Run logs and consumer groups over `event_log`.
//!
//! Appends for one run are serialized with a transaction-scoped advisory
//! lock, so entry ids within a log commit in increasing order and a group
//! cursor never skips an entry that commits late.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use super::{EVENT_APPENDED_CHANNEL, Role};
use crate::error::{Error, Result};
use crate::model::event::{EntryId, LogEntry};
use crate::model::{RunLinks, WorkflowId, WorkflowRun};
use crate::store::{EventLog, PendingEntry};

/// Trim a log once every this many appends (by entry id).
const TRIM_EVERY: i64 = 64;

fn entries(rows: Vec<(i64, String)>) -> Vec<LogEntry> {
    rows.into_iter()
        .map(|(id, payload)| LogEntry {
            id: EntryId(id),
            payload,
        })
        .collect()
}

fn group_not_found(log: &WorkflowId, group: &str) -> Error {
    Error::NotFound(format!("consumer group {group} on {log}"))
}

impl super::Db {
    async fn group_exists(&self, log: &WorkflowId, group: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT last_delivered_id FROM consumer_groups WHERE log = $1 AND group_name = $2",
        )
        .bind(log.as_str())
        .bind(group)
        .fetch_optional(&self.general)
        .await?;
        Ok(row.is_some())
    }

    /// Move never-delivered entries into the pending set and advance the cursor.
    async fn deliver_new(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut tx = self.general.begin().await?;
        let cursor: Option<(i64,)> = sqlx::query_as(
            "SELECT last_delivered_id FROM consumer_groups
             WHERE log = $1 AND group_name = $2 FOR UPDATE",
        )
        .bind(log.as_str())
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?;
        let (last_delivered,) = cursor.ok_or_else(|| group_not_found(log, group))?;

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, payload FROM event_log
             WHERE workflow_id = $1 AND id > $2
             ORDER BY id LIMIT $3",
        )
        .bind(log.as_str())
        .bind(last_delivered)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?;

        if let Some(&(newest, _)) = rows.last() {
            let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
            sqlx::query(
                "INSERT INTO consumer_pending (log, group_name, entry_id, consumer)
                 SELECT $1, $2, unnest($3::bigint[]), $4
                 ON CONFLICT DO NOTHING",
            )
            .bind(log.as_str())
            .bind(group)
            .bind(&ids)
            .bind(consumer)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE consumer_groups SET last_delivered_id = $3
                 WHERE log = $1 AND group_name = $2",
            )
            .bind(log.as_str())
            .bind(group)
            .bind(newest)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(entries(rows))
    }

    async fn trim(&self, log: &WorkflowId, max_len: usize) -> Result<()> {
        let removed = sqlx::query(
            "DELETE FROM event_log
             WHERE workflow_id = $1 AND id <= (
                 SELECT id FROM event_log WHERE workflow_id = $1
                 ORDER BY id DESC OFFSET $2 LIMIT 1)",
        )
        .bind(log.as_str())
        .bind(max_len as i64)
        .execute(&self.publisher)
        .await?
        .rows_affected();
        if removed > 0 {
            tracing::debug!(%log, removed, "log trimmed");
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for super::Db {
    async fn append(
        &self,
        log: &WorkflowId,
        payload: &str,
        max_len: Option<usize>,
    ) -> Result<EntryId> {
        let id = self
            .conn
            .retrying(Role::Publisher, "events.append", || async move {
                let mut tx = self.publisher.begin().await?;
                sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                    .bind(log.as_str())
                    .execute(&mut *tx)
                    .await?;
                // First event for an unknown id creates a bare run.
                sqlx::query("INSERT INTO workflow_runs (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
                    .bind(log.as_str())
                    .execute(&mut *tx)
                    .await?;
                let (id,): (i64,) = sqlx::query_as(
                    "INSERT INTO event_log (workflow_id, payload) VALUES ($1, $2) RETURNING id",
                )
                .bind(log.as_str())
                .bind(payload)
                .fetch_one(&mut *tx)
                .await?;
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(EVENT_APPENDED_CHANNEL)
                    .bind(log.as_str())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(id)
            })
            .await?;

        if let Some(max_len) = max_len.filter(|_| id % TRIM_EVERY == 0) {
            if let Err(e) = self.trim(log, max_len).await {
                warn!(%log, error = %e, "log trim failed");
            }
        }
        Ok(EntryId(id))
    }

    async fn read_range(
        &self,
        log: &WorkflowId,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let after = after.map_or(0, |id| id.0);
        let rows: Vec<(i64, String)> = self
            .conn
            .retrying(Role::General, "events.read_range", || async move {
                Ok(sqlx::query_as(
                    "SELECT id, payload FROM event_log
                     WHERE workflow_id = $1 AND id > $2
                     ORDER BY id LIMIT $3",
                )
                .bind(log.as_str())
                .bind(after)
                .bind(limit as i64)
                .fetch_all(&self.general)
                .await?)
            })
            .await?;
        Ok(entries(rows))
    }

    async fn ensure_group(&self, log: &WorkflowId, group: &str) -> Result<bool> {
        let created = sqlx::query(
            "INSERT INTO consumer_groups (log, group_name, last_delivered_id)
             VALUES ($1, $2, 0)
             ON CONFLICT (log, group_name) DO NOTHING",
        )
        .bind(log.as_str())
        .bind(group)
        .execute(&self.general)
        .await?
        .rows_affected();
        Ok(created == 1)
    }

    async fn read_group(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let waiter = if block.is_zero() {
            None
        } else {
            Some(self.event_wakeups().await?.waiter())
        };
        let fresh = self.deliver_new(log, group, consumer, count).await?;
        match waiter {
            Some(waiter) if fresh.is_empty() => {
                waiter.wait_for(log.as_str(), block).await;
                self.deliver_new(log, group, consumer, count).await
            }
            _ => Ok(fresh),
        }
    }

    async fn claim_stale(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        if !self.group_exists(log, group).await? {
            return Err(group_not_found(log, group));
        }
        let claimed: Vec<(i64,)> = sqlx::query_as(
            "WITH stale AS (
                 SELECT entry_id FROM consumer_pending
                 WHERE log = $1 AND group_name = $2
                   AND delivered_at <= now() - make_interval(secs => $3)
                 ORDER BY entry_id LIMIT $4
                 FOR UPDATE SKIP LOCKED)
             UPDATE consumer_pending p
             SET consumer = $5, delivered_at = now(), delivery_count = p.delivery_count + 1
             FROM stale
             WHERE p.log = $1 AND p.group_name = $2 AND p.entry_id = stale.entry_id
             RETURNING p.entry_id",
        )
        .bind(log.as_str())
        .bind(group)
        .bind(min_idle.as_secs_f64())
        .bind(count as i64)
        .bind(consumer)
        .fetch_all(&self.general)
        .await?;
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = claimed.into_iter().map(|(id,)| id).collect();
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, payload FROM event_log
             WHERE workflow_id = $1 AND id = ANY($2)
             ORDER BY id",
        )
        .bind(log.as_str())
        .bind(&ids)
        .fetch_all(&self.general)
        .await?;

        // Pending entries whose log entry was trimmed can never be delivered.
        let trimmed: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !rows.iter().any(|(found, _)| found == id))
            .collect();
        if !trimmed.is_empty() {
            warn!(%log, group, count = trimmed.len(), "pending entries were trimmed from the log");
            sqlx::query(
                "DELETE FROM consumer_pending
                 WHERE log = $1 AND group_name = $2 AND entry_id = ANY($3)",
            )
            .bind(log.as_str())
            .bind(group)
            .bind(&trimmed)
            .execute(&self.general)
            .await?;
        }
        Ok(entries(rows))
    }

    async fn ack(&self, log: &WorkflowId, group: &str, ids: &[EntryId]) -> Result<u64> {
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let ids = &ids;
        self.conn
            .retrying(Role::General, "events.ack", || async move {
                Ok(sqlx::query(
                    "DELETE FROM consumer_pending
                     WHERE log = $1 AND group_name = $2 AND entry_id = ANY($3)",
                )
                .bind(log.as_str())
                .bind(group)
                .bind(ids)
                .execute(&self.general)
                .await?
                .rows_affected())
            })
            .await
    }

    async fn pending(&self, log: &WorkflowId, group: &str) -> Result<Vec<PendingEntry>> {
        if !self.group_exists(log, group).await? {
            return Err(group_not_found(log, group));
        }
        let rows: Vec<(i64, String, f64, i32)> = sqlx::query_as(
            "SELECT entry_id, consumer,
                    EXTRACT(EPOCH FROM (now() - delivered_at))::float8,
                    delivery_count
             FROM consumer_pending
             WHERE log = $1 AND group_name = $2
             ORDER BY entry_id",
        )
        .bind(log.as_str())
        .bind(group)
        .fetch_all(&self.general)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle, delivery_count)| PendingEntry {
                id: EntryId(id),
                consumer,
                idle: Duration::from_secs_f64(idle.max(0.0)),
                delivery_count: delivery_count.max(0) as u32,
            })
            .collect())
    }

    async fn run(&self, id: &WorkflowId) -> Result<Option<WorkflowRun>> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, workflow_name, actor, repo, issue_number, commit_sha, created_at
             FROM workflow_runs WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.general)
        .await?;
        Ok(row.map(RunRow::into_run))
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    workflow_name: Option<String>,
    actor: Option<String>,
    repo: Option<String>,
    issue_number: Option<i64>,
    commit_sha: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl RunRow {
    fn into_run(self) -> WorkflowRun {
        WorkflowRun {
            id: WorkflowId::new(self.id),
            workflow_name: self.workflow_name,
            actor: self.actor,
            links: RunLinks {
                repo: self.repo,
                issue_number: self.issue_number,
                commit_sha: self.commit_sha,
            },
            created_at: self.created_at,
        }
    }
}
