//! Durable group consumer over a run's event log.
//!
//! At-least-once: an entry is acknowledged only after its handler returns
//! `Ok`. A failing handler leaves the entry pending; once it has been idle
//! for `claim_idle` it is reclaimed and delivered again, to this consumer or
//! to whichever consumer of the group gets there first.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::event::{EntryId, LogEntry};
use crate::model::{EventRecord, WorkflowId};
use crate::store::EventLog;
use crate::telemetry::metrics;

/// One entry handed to a handler.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event {
        id: EntryId,
        record: EventRecord,
    },
    /// Not a valid event record. Passed through so the handler decides.
    Malformed {
        id: EntryId,
        raw: String,
        error: String,
    },
}

impl Delivery {
    fn from_entry(entry: LogEntry) -> Self {
        match entry.parse() {
            Ok(record) => Delivery::Event {
                id: entry.id,
                record,
            },
            Err(e) => Delivery::Malformed {
                id: entry.id,
                raw: entry.payload,
                error: e.to_string(),
            },
        }
    }

    pub fn id(&self) -> EntryId {
        match self {
            Delivery::Event { id, .. } | Delivery::Malformed { id, .. } => *id,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// `Ok` acknowledges the entry; `Err` leaves it pending for redelivery.
    async fn handle(&self, delivery: &Delivery) -> Result<()>;
}

/// Tuning for the read loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Longest a single read waits for new entries.
    pub block_timeout: Duration,
    pub batch_size: usize,
    /// Pending entries idle this long are reclaimed.
    pub claim_idle: Duration,
    /// Pause after a store error before the next iteration.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(5),
            batch_size: 10,
            claim_idle: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of one [`EventConsumer::poll_once`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub delivered: usize,
    pub acked: usize,
    pub failed: usize,
}

pub struct EventConsumer {
    log: Arc<dyn EventLog>,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(log: Arc<dyn EventLog>, config: ConsumerConfig) -> Self {
        Self { log, config }
    }

    /// Create `group` on `log` if missing. An existing group is left alone.
    pub async fn ensure_group(&self, log: &WorkflowId, group: &str) -> Result<()> {
        if self.log.ensure_group(log, group).await? {
            info!(%log, group, "consumer group created");
        } else {
            debug!(%log, group, "consumer group already exists");
        }
        Ok(())
    }

    /// Run the read loop until `shutdown` fires.
    ///
    /// Handler failures and store errors never end the loop.
    pub async fn read_group(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        handler: &dyn EventHandler,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.ensure_group(log, group).await?;
        info!(%log, group, consumer, "consumer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.poll_once(log, group, consumer, handler) => {
                    if let Err(e) = polled {
                        warn!(%log, group, consumer, error = %e, "consumer read failed");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                    }
                }
            }
        }
        info!(%log, group, consumer, "consumer stopped");
        Ok(())
    }

    /// One iteration: reclaim stale entries, else wait for new ones, then
    /// hand each to `handler` in log order.
    pub async fn poll_once(
        &self,
        log: &WorkflowId,
        group: &str,
        consumer: &str,
        handler: &dyn EventHandler,
    ) -> Result<PollStats> {
        let mut entries = self
            .log
            .claim_stale(log, group, consumer, self.config.claim_idle, self.config.batch_size)
            .await?;
        if !entries.is_empty() {
            debug!(%log, group, consumer, count = entries.len(), "reclaimed stale entries");
        } else {
            entries = self
                .log
                .read_group(
                    log,
                    group,
                    consumer,
                    self.config.batch_size,
                    self.config.block_timeout,
                )
                .await?;
        }

        let mut stats = PollStats {
            delivered: entries.len(),
            ..PollStats::default()
        };
        let mut acked = Vec::with_capacity(entries.len());
        for entry in entries {
            let delivery = Delivery::from_entry(entry);
            let malformed = matches!(delivery, Delivery::Malformed { .. });
            match handler.handle(&delivery).await {
                Ok(()) => {
                    acked.push(delivery.id());
                    let outcome = if malformed { "malformed" } else { "acked" };
                    metrics::events_delivered().add(
                        1,
                        &[
                            KeyValue::new("group", group.to_string()),
                            KeyValue::new("outcome", outcome),
                        ],
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(%log, group, consumer, entry = %delivery.id(), error = %e, "handler failed, entry left pending");
                    metrics::events_delivered().add(
                        1,
                        &[
                            KeyValue::new("group", group.to_string()),
                            KeyValue::new("outcome", "failed"),
                        ],
                    );
                }
            }
        }

        if !acked.is_empty() {
            stats.acked = self.log.ack(log, group, &acked).await? as usize;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<Delivery>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, delivery: &Delivery) -> Result<()> {
            self.seen.lock().unwrap().push(delivery.clone());
            if self.fail {
                Err(Error::Other("handler down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn recorder(fail: bool) -> Recorder {
        Recorder {
            seen: Mutex::new(Vec::new()),
            fail,
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            block_timeout: Duration::ZERO,
            claim_idle: Duration::from_secs(30),
            ..ConsumerConfig::default()
        }
    }

    #[tokio::test]
    async fn malformed_entries_reach_the_handler() {
        let store = Arc::new(MemoryStore::new());
        let w1 = WorkflowId::from("w1");
        store.append(&w1, "not json", None).await.unwrap();
        let consumer = EventConsumer::new(store.clone(), config());
        consumer.ensure_group(&w1, "archive").await.unwrap();

        let handler = recorder(false);
        let stats = consumer.poll_once(&w1, "archive", "c1", &handler).await.unwrap();
        assert_eq!(stats.acked, 1);
        let seen = handler.seen.lock().unwrap();
        assert!(matches!(&seen[0], Delivery::Malformed { raw, .. } if raw == "not json"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_entries_stay_pending_and_are_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let w1 = WorkflowId::from("w1");
        store
            .append(&w1, r#"{"workflowId":"w1","type":"status","content":"step1"}"#, None)
            .await
            .unwrap();
        let consumer = EventConsumer::new(store.clone(), config());
        consumer.ensure_group(&w1, "g").await.unwrap();

        let failing = recorder(true);
        let stats = consumer.poll_once(&w1, "g", "c1", &failing).await.unwrap();
        assert_eq!(stats, PollStats { delivered: 1, acked: 0, failed: 1 });
        assert_eq!(store.pending(&w1, "g").await.unwrap().len(), 1);

        // Not idle long enough yet: nothing new, nothing reclaimed.
        let healthy = recorder(false);
        let stats = consumer.poll_once(&w1, "g", "c2", &healthy).await.unwrap();
        assert_eq!(stats.delivered, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let stats = consumer.poll_once(&w1, "g", "c2", &healthy).await.unwrap();
        assert_eq!(stats, PollStats { delivered: 1, acked: 1, failed: 0 });
        assert!(store.pending(&w1, "g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_group_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let consumer = EventConsumer::new(
            store,
            ConsumerConfig {
                block_timeout: Duration::from_millis(10),
                ..ConsumerConfig::default()
            },
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let handler = recorder(false);
        consumer
            .read_group(&"w1".into(), "g", "c1", &handler, shutdown)
            .await
            .unwrap();
    }
}
