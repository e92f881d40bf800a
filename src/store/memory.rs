//! In-process implementation of the storage traits.
//!
//! Same visibility-timeout and consumer-group semantics as the Postgres
//! backend, without durability.
//! Used by the test suite and by `runrelay serve --in-memory`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::warn;

use super::{ClaimedJob, EventLog, HealthCheck, JobStore, LiveChannel, PendingEntry, Subscription};
use crate::error::{Error, Result};
use crate::model::event::{EntryId, LogEntry};
use crate::model::{JobId, JobState, NewJob, QueueJob, Retention, WorkflowId, WorkflowRun};

/// Buffer of each live channel. Slow subscribers lag past this.
const LIVE_CAPACITY: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct JobTables {
    jobs: HashMap<JobId, QueueJob>,
    queues: HashMap<String, Vec<QueuedMessage>>,
    next_msg_id: i64,
}

struct QueuedMessage {
    msg_id: i64,
    job_id: JobId,
    visible_at: Instant,
}

#[derive(Default)]
struct LogTables {
    logs: HashMap<WorkflowId, Vec<LogEntry>>,
    next_entry_id: i64,
    groups: HashMap<(WorkflowId, String), GroupState>,
    runs: HashMap<WorkflowId, WorkflowRun>,
}

struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingMeta>,
}

struct PendingMeta {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

/// In-memory backend implementing [`JobStore`], [`EventLog`] and [`LiveChannel`].
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<JobTables>,
    log: Mutex<LogTables>,
    live: Mutex<HashMap<String, broadcast::Sender<String>>>,
    job_ready: Notify,
    appended: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(job: &mut QueueJob, to: JobState) -> Result<()> {
        if !job.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: job.state.to_string(),
                to: to.to_string(),
            });
        }
        job.state = to;
        job.updated_at = Utc::now();
        if to.is_terminal() {
            job.finished_at = Some(job.updated_at);
        }
        Ok(())
    }

    fn drop_message(tables: &mut JobTables, queue: &str, receipt: i64) {
        if let Some(messages) = tables.queues.get_mut(queue) {
            messages.retain(|m| m.msg_id != receipt);
        }
    }

    fn apply_retention(tables: &mut JobTables, job: &QueueJob, retention: Retention) {
        match retention {
            Retention::Keep => {}
            Retention::Remove => {
                tables.jobs.remove(&job.id);
            }
            Retention::KeepLast(n) => {
                let mut finished: Vec<_> = tables
                    .jobs
                    .values()
                    .filter(|j| j.queue == job.queue && j.state == job.state)
                    .map(|j| (j.finished_at, j.id))
                    .collect();
                finished.sort_by(|a, b| b.cmp(a));
                for (_, id) in finished.into_iter().skip(n as usize) {
                    tables.jobs.remove(&id);
                }
            }
        }
    }

    fn settle(
        &self,
        claim: &ClaimedJob,
        to: JobState,
        error: Option<&str>,
        retention: Retention,
    ) -> Result<()> {
        let mut tables = lock(&self.jobs);
        let job = tables
            .jobs
            .get_mut(&claim.job.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", claim.job.id)))?;
        Self::transition(job, to)?;
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        let job = job.clone();
        Self::drop_message(&mut tables, &job.queue, claim.receipt);
        Self::apply_retention(&mut tables, &job, retention);
        Ok(())
    }

    fn deliver_new(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut tables = lock(&self.log);
        let tables = &mut *tables;
        let state = tables
            .groups
            .get_mut(&(log.clone(), group.to_string()))
            .ok_or_else(|| Error::NotFound(format!("consumer group {group} on {log}")))?;

        let fresh: Vec<LogEntry> = tables
            .logs
            .get(log)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.id > state.last_delivered)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let now = Instant::now();
        for entry in &fresh {
            state.pending.insert(
                entry.id,
                PendingMeta {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            state.last_delivered = entry.id;
        }
        Ok(fresh)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        lock(&self.jobs).queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn enqueue(&self, new: NewJob) -> Result<QueueJob> {
        let now = Utc::now();
        let job = QueueJob {
            id: new.id,
            queue: new.queue.clone(),
            workflow_id: new.run.id.clone(),
            payload: new.payload,
            opts: new.opts,
            attempts: 0,
            state: JobState::Queued,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        lock(&self.log)
            .runs
            .entry(new.run.id.clone())
            .or_insert(new.run);

        {
            let mut tables = lock(&self.jobs);
            tables.next_msg_id += 1;
            let msg_id = tables.next_msg_id;
            tables.jobs.insert(job.id, job.clone());
            tables
                .queues
                .entry(new.queue)
                .or_default()
                .push(QueuedMessage {
                    msg_id,
                    job_id: job.id,
                    visible_at: Instant::now(),
                });
        }

        self.job_ready.notify_waiters();
        Ok(job)
    }

    async fn claim(&self, queue: &str, visibility: Duration) -> Result<Option<ClaimedJob>> {
        let now = Instant::now();
        let mut tables = lock(&self.jobs);
        let tables = &mut *tables;
        let Some(messages) = tables.queues.get_mut(queue) else {
            return Ok(None);
        };

        loop {
            let Some(pos) = messages.iter().position(|m| m.visible_at <= now) else {
                return Ok(None);
            };
            let receipt = messages[pos].msg_id;
            match tables.jobs.get_mut(&messages[pos].job_id) {
                Some(job) if !job.state.is_terminal() => {
                    Self::transition(job, JobState::Active)?;
                    job.attempts += 1;
                    messages[pos].visible_at = now + visibility;
                    return Ok(Some(ClaimedJob {
                        job: job.clone(),
                        receipt,
                    }));
                }
                // Message outlived its job (settled or removed): discard it.
                _ => {
                    messages.remove(pos);
                }
            }
        }
    }

    async fn extend(&self, claim: &ClaimedJob, visibility: Duration) -> Result<()> {
        let mut tables = lock(&self.jobs);
        if let Some(msg) = tables
            .queues
            .get_mut(&claim.job.queue)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.msg_id == claim.receipt))
        {
            msg.visible_at = Instant::now() + visibility;
        }
        Ok(())
    }

    async fn complete(&self, claim: &ClaimedJob, retention: Retention) -> Result<()> {
        self.settle(claim, JobState::Completed, None, retention)
    }

    async fn retry(&self, claim: &ClaimedJob, delay: Duration, error: &str) -> Result<()> {
        let mut tables = lock(&self.jobs);
        let job = tables
            .jobs
            .get_mut(&claim.job.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", claim.job.id)))?;
        Self::transition(job, JobState::Queued)?;
        job.last_error = Some(error.to_string());

        if let Some(msg) = tables
            .queues
            .get_mut(&claim.job.queue)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.msg_id == claim.receipt))
        {
            msg.visible_at = Instant::now() + delay;
        }
        Ok(())
    }

    async fn fail(&self, claim: &ClaimedJob, error: &str, retention: Retention) -> Result<()> {
        self.settle(claim, JobState::Failed, Some(error), retention)
    }

    async fn get_job(&self, id: JobId) -> Result<QueueJob> {
        lock(&self.jobs)
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn wait_for_jobs(&self, _queue: &str, timeout: Duration) -> Result<()> {
        let _ = tokio::time::timeout(timeout, self.job_ready.notified()).await;
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(
        &self,
        log: &WorkflowId,
        payload: &str,
        max_len: Option<usize>,
    ) -> Result<EntryId> {
        let id = {
            let mut tables = lock(&self.log);
            tables.next_entry_id += 1;
            let id = EntryId(tables.next_entry_id);
            tables
                .runs
                .entry(log.clone())
                .or_insert_with(|| WorkflowRun::new(log.clone()));
            let entries = tables.logs.entry(log.clone()).or_default();
            entries.push(LogEntry {
                id,
                payload: payload.to_string(),
            });
            if let Some(max) = max_len {
                // Trim in batches so the cap is approximate, like the Postgres log.
                if entries.len() > max + max / 10 + 1 {
                    let excess = entries.len() - max;
                    entries.drain(..excess);
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_range(
        &self,
        log: &WorkflowId,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let after = after.unwrap_or(EntryId(0));
        Ok(lock(&self.log)
            .logs
            .get(log)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.id > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ensure_group(&self, log: &WorkflowId, group: &str) -> Result<bool> {
        let mut tables = lock(&self.log);
        let key = (log.clone(), group.to_string());
        if tables.groups.contains_key(&key) {
            return Ok(false);
        }
        tables.groups.insert(
            key,
            GroupState {
                last_delivered: EntryId(0),
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let notified = self.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let entries = self.deliver_new(log, group, consumer, count)?;
        if !entries.is_empty() || block.is_zero() {
            return Ok(entries);
        }
        let _ = tokio::time::timeout(block, notified).await;
        self.deliver_new(log, group, consumer, count)
    }

    async fn claim_stale(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut tables = lock(&self.log);
        let tables = &mut *tables;
        let state = tables
            .groups
            .get_mut(&(log.clone(), group.to_string()))
            .ok_or_else(|| Error::NotFound(format!("consumer group {group} on {log}")))?;
        let entries = tables.logs.get(log);

        let now = Instant::now();
        let stale: Vec<EntryId> = state
            .pending
            .iter()
            .filter(|(_, meta)| now.duration_since(meta.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let mut claimed = Vec::new();
        for id in stale {
            let entry = entries.and_then(|es| es.iter().find(|e| e.id == id));
            match entry {
                Some(entry) => {
                    if let Some(meta) = state.pending.get_mut(&id) {
                        meta.consumer = consumer.to_string();
                        meta.delivered_at = now;
                        meta.delivery_count += 1;
                    }
                    claimed.push(entry.clone());
                }
                None => {
                    warn!(%log, group, entry = %id, "pending entry was trimmed from the log");
                    state.pending.remove(&id);
                }
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, log: &WorkflowId, group: &str, ids: &[EntryId]) -> Result<u64> {
        let mut tables = lock(&self.log);
        let Some(state) = tables.groups.get_mut(&(log.clone(), group.to_string())) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| state.pending.remove(*id).is_some())
            .count() as u64)
    }

    async fn pending(&self, log: &WorkflowId, group: &str) -> Result<Vec<PendingEntry>> {
        let tables = lock(&self.log);
        let state = tables
            .groups
            .get(&(log.clone(), group.to_string()))
            .ok_or_else(|| Error::NotFound(format!("consumer group {group} on {log}")))?;
        let now = Instant::now();
        Ok(state
            .pending
            .iter()
            .map(|(id, meta)| PendingEntry {
                id: *id,
                consumer: meta.consumer.clone(),
                idle: now.duration_since(meta.delivered_at),
                delivery_count: meta.delivery_count,
            })
            .collect())
    }

    async fn run(&self, id: &WorkflowId) -> Result<Option<WorkflowRun>> {
        Ok(lock(&self.log).runs.get(id).cloned())
    }
}

#[async_trait]
impl LiveChannel for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if let Some(sender) = lock(&self.live).get(channel) {
            // No receivers is not an error: nobody is watching.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let rx = lock(&self.live)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(LIVE_CAPACITY).0)
            .subscribe();
        Ok(Box::new(MemorySubscription { rx: Some(rx) }))
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

struct MemorySubscription {
    rx: Option<broadcast::Receiver<String>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<String>> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        loop {
            match rx.recv().await {
                Ok(msg) => return Ok(Some(msg)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.rx = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.rx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobOptions, JobPayload};
    use serde_json::json;

    fn new_job(queue: &str) -> NewJob {
        NewJob {
            id: JobId::new(),
            queue: queue.to_string(),
            payload: JobPayload::new("noop", json!({})),
            opts: JobOptions::default(),
            run: WorkflowRun::new(WorkflowId::generate()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_job_is_invisible_until_timeout() {
        let store = MemoryStore::new();
        store.enqueue(new_job("q")).await.unwrap();

        let first = store.claim("q", Duration::from_secs(30)).await.unwrap();
        assert!(first.is_some());
        assert!(store.claim("q", Duration::from_secs(30)).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = store.claim("q", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(again.job.attempts, 2);
        assert_eq!(again.job.state, JobState::Active);
    }

    #[tokio::test]
    async fn completed_job_message_is_gone() {
        let store = MemoryStore::new();
        let job = store.enqueue(new_job("q")).await.unwrap();
        let claim = store.claim("q", Duration::from_secs(30)).await.unwrap().unwrap();
        store.complete(&claim, Retention::Keep).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert!(stored.finished_at.is_some());
        assert!(store.claim("q", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keep_last_prunes_oldest_records() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.enqueue(new_job("q")).await.unwrap().id);
            let claim = store.claim("q", Duration::from_secs(30)).await.unwrap().unwrap();
            store.complete(&claim, Retention::KeepLast(2)).await.unwrap();
        }
        assert!(store.get_job(ids[0]).await.is_err());
        assert!(store.get_job(ids[2]).await.is_ok());
    }

    #[tokio::test]
    async fn read_group_without_group_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .read_group(&"w".into(), "g", "c", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn append_trims_approximately() {
        let store = MemoryStore::new();
        let log: WorkflowId = "w".into();
        for i in 0..100 {
            store.append(&log, &i.to_string(), Some(10)).await.unwrap();
        }
        let len = store.read_all(&log).await.unwrap().len();
        assert!((10..=12).contains(&len), "len = {len}");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let store = MemoryStore::new();
        store.publish("workflow_status", "hello").await.unwrap();
        let mut sub = store.subscribe("workflow_status").await.unwrap();
        store.publish("workflow_status", "world").await.unwrap();
        assert_eq!(sub.next_message().await.unwrap().as_deref(), Some("world"));
        sub.unsubscribe().await.unwrap();
        assert_eq!(sub.next_message().await.unwrap(), None);
    }
}
