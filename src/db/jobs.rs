//! Job store over `queue_jobs` + pgmq.
//!
//! The pgmq message carries only `{"job_id": ...}`; the row is the source of
//! truth for state, attempts, and options. A message whose row is gone or
//! already terminal is archived on sight.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::{JOB_READY_CHANNEL, Role, pgmq};
use crate::error::{Error, Result};
use crate::model::{JobId, JobOptions, JobPayload, JobState, NewJob, QueueJob, Retention, WorkflowId};
use crate::store::{ClaimedJob, JobStore};
use crate::telemetry::metrics;

const JOB_COLUMNS: &str = "id, queue_name, workflow_id, name, data, opts, attempts, state, last_error, created_at, updated_at, finished_at";

/// Validate a state transition, returning an error if disallowed.
fn validate_transition(from: JobState, to: JobState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn record_transition(queue: &str, from: JobState, to: JobState) {
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

impl super::Db {
    /// Move an active job to `to`. Zero rows means someone else settled it.
    async fn settle_row(
        &self,
        claim: &ClaimedJob,
        to: JobState,
        error: Option<&str>,
    ) -> Result<()> {
        validate_transition(JobState::Active, to)?;
        let id = claim.job.id.0;
        let rows = self
            .conn
            .retrying(Role::Queue, "jobs.settle", || async move {
                Ok(sqlx::query(
                    "UPDATE queue_jobs
                     SET state = $1, last_error = COALESCE($2, last_error), updated_at = now(),
                         finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
                     WHERE id = $4 AND state = 'active'",
                )
                .bind(to.as_str())
                .bind(error)
                .bind(to.is_terminal())
                .bind(id)
                .execute(&self.queue)
                .await?
                .rows_affected())
            })
            .await?;
        if rows == 0 {
            return Err(Error::InvalidTransition {
                from: "active".to_string(),
                to: to.to_string(),
            });
        }
        record_transition(&claim.job.queue, JobState::Active, to);
        Ok(())
    }

    async fn apply_retention(&self, job: &QueueJob, state: JobState, retention: Retention) -> Result<()> {
        match retention {
            Retention::Keep => {}
            Retention::Remove => {
                sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
                    .bind(job.id.0)
                    .execute(&self.queue)
                    .await?;
            }
            Retention::KeepLast(n) => {
                sqlx::query(
                    "DELETE FROM queue_jobs
                     WHERE queue_name = $1 AND state = $2 AND id NOT IN (
                         SELECT id FROM queue_jobs
                         WHERE queue_name = $1 AND state = $2
                         ORDER BY finished_at DESC, id DESC
                         LIMIT $3)",
                )
                .bind(&job.queue)
                .bind(state.as_str())
                .bind(i64::from(n))
                .execute(&self.queue)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for super::Db {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        pgmq::create(&self.queue, queue).await
    }

    async fn enqueue(&self, new: NewJob) -> Result<QueueJob> {
        let new = &new;
        let opts = serde_json::to_value(new.opts)?;
        let opts = &opts;
        let result = self
            .conn
            .retrying(Role::Queue, "jobs.enqueue", || async move {
                let mut tx = self.queue.begin().await?;
                let run = &new.run;
                sqlx::query(
                    "INSERT INTO workflow_runs (id, workflow_name, actor, repo, issue_number, commit_sha, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(run.id.as_str())
                .bind(&run.workflow_name)
                .bind(&run.actor)
                .bind(&run.links.repo)
                .bind(run.links.issue_number)
                .bind(&run.links.commit_sha)
                .bind(run.created_at)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO queue_jobs (id, queue_name, workflow_id, name, data, opts, state)
                     VALUES ($1, $2, $3, $4, $5, $6, 'queued')",
                )
                .bind(new.id.0)
                .bind(&new.queue)
                .bind(run.id.as_str())
                .bind(&new.payload.name)
                .bind(&new.payload.data)
                .bind(opts)
                .execute(&mut *tx)
                .await?;

                let payload = serde_json::json!({ "job_id": new.id.0 });
                let msg_id = pgmq::send(&mut *tx, &new.queue, &payload, 0).await?;
                sqlx::query("UPDATE queue_jobs SET pgmq_msg_id = $1 WHERE id = $2")
                    .bind(msg_id)
                    .bind(new.id.0)
                    .execute(&mut *tx)
                    .await?;

                // NOTIFY is transactional: only fires on commit
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(JOB_READY_CHANNEL)
                    .bind(&new.queue)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(())
            })
            .await;

        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("queue", new.queue.clone()),
                KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
            ],
        );
        result?;
        self.get_job(new.id).await
    }

    async fn claim(&self, queue: &str, visibility: Duration) -> Result<Option<ClaimedJob>> {
        let vt = pgmq::vt_seconds(visibility);
        loop {
            let Some(msg) = pgmq::read(&self.queue, queue, vt).await? else {
                return Ok(None);
            };
            let job_id = msg
                .message
                .get("job_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uuid>().ok());
            let Some(job_id) = job_id else {
                warn!(queue, msg_id = msg.msg_id, "queue message without a job id, archiving");
                pgmq::archive(&self.queue, queue, msg.msg_id).await?;
                continue;
            };

            // `active` here means the previous claimant died without settling.
            let sql = format!(
                "WITH prev AS (
                     SELECT id AS prev_id, state AS previous_state
                     FROM queue_jobs WHERE id = $1 FOR UPDATE
                 )
                 UPDATE queue_jobs SET state = 'active', attempts = attempts + 1, updated_at = now()
                 FROM prev
                 WHERE id = prev.prev_id AND prev.previous_state IN ('queued', 'active')
                 RETURNING {JOB_COLUMNS}, prev.previous_state"
            );
            let row: Option<ClaimRow> = sqlx::query_as(&sql)
                .bind(job_id)
                .fetch_optional(&self.queue)
                .await?;
            match row {
                Some(row) => {
                    let (job, previous) = row.into_claim()?;
                    record_transition(queue, previous, JobState::Active);
                    return Ok(Some(ClaimedJob {
                        job,
                        receipt: msg.msg_id,
                    }));
                }
                // Message outlived its job (settled or removed): discard it.
                None => pgmq::archive(&self.queue, queue, msg.msg_id).await?,
            }
        }
    }

    async fn extend(&self, claim: &ClaimedJob, visibility: Duration) -> Result<()> {
        let vt = pgmq::vt_seconds(visibility);
        pgmq::set_vt(&self.queue, &claim.job.queue, claim.receipt, vt).await
    }

    async fn complete(&self, claim: &ClaimedJob, retention: Retention) -> Result<()> {
        self.settle_row(claim, JobState::Completed, None).await?;
        pgmq::delete(&self.queue, &claim.job.queue, claim.receipt).await?;
        self.apply_retention(&claim.job, JobState::Completed, retention)
            .await
    }

    async fn retry(&self, claim: &ClaimedJob, delay: Duration, error: &str) -> Result<()> {
        self.settle_row(claim, JobState::Queued, Some(error)).await?;
        pgmq::set_vt(
            &self.queue,
            &claim.job.queue,
            claim.receipt,
            pgmq::vt_seconds(delay),
        )
        .await
    }

    async fn fail(&self, claim: &ClaimedJob, error: &str, retention: Retention) -> Result<()> {
        self.settle_row(claim, JobState::Failed, Some(error)).await?;
        pgmq::archive(&self.queue, &claim.job.queue, claim.receipt).await?;
        self.apply_retention(&claim.job, JobState::Failed, retention)
            .await
    }

    async fn get_job(&self, id: JobId) -> Result<QueueJob> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.queue)
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    async fn wait_for_jobs(&self, queue: &str, timeout: Duration) -> Result<()> {
        let waiter = self.job_wakeups().await?.waiter();
        waiter.wait_for(queue, timeout).await;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    workflow_id: String,
    name: String,
    data: serde_json::Value,
    opts: serde_json::Value,
    attempts: i32,
    state: String,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A claimed row plus the state it was claimed from.
#[derive(sqlx::FromRow)]
struct ClaimRow {
    #[sqlx(flatten)]
    job: JobRow,
    previous_state: String,
}

impl ClaimRow {
    fn into_claim(self) -> Result<(QueueJob, JobState)> {
        let previous = self.previous_state.parse()?;
        Ok((self.job.try_into_job()?, previous))
    }
}

impl JobRow {
    fn try_into_job(self) -> Result<QueueJob> {
        let opts: JobOptions = serde_json::from_value(self.opts)?;
        Ok(QueueJob {
            id: JobId(self.id),
            queue: self.queue_name,
            workflow_id: WorkflowId::new(self.workflow_id),
            payload: JobPayload::new(self.name, self.data),
            opts,
            attempts: self.attempts.max(0) as u32,
            state: self.state.parse()?,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claim_row(previous_state: &str) -> ClaimRow {
        let now = chrono::Utc::now();
        ClaimRow {
            job: JobRow {
                id: Uuid::new_v4(),
                queue_name: "workflow-jobs".to_string(),
                workflow_id: "w1".to_string(),
                name: "resolveIssue".to_string(),
                data: json!({"issueNumber": 42}),
                opts: serde_json::to_value(JobOptions::default()).unwrap(),
                attempts: 2,
                state: "active".to_string(),
                last_error: None,
                created_at: now,
                updated_at: now,
                finished_at: None,
            },
            previous_state: previous_state.to_string(),
        }
    }

    #[test]
    fn redelivered_claim_reports_active_as_its_previous_state() {
        let (job, previous) = claim_row("active").into_claim().unwrap();
        assert_eq!(previous, JobState::Active);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 2);

        let (_, previous) = claim_row("queued").into_claim().unwrap();
        assert_eq!(previous, JobState::Queued);
    }

    #[test]
    fn unknown_previous_state_is_an_error() {
        assert!(claim_row("paused").into_claim().is_err());
    }
}
