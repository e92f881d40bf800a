//! Collaborator ports: where a run's events go after the log.
//!
//! [`ArchiveForwarder`] is an [`EventHandler`] that copies every event into
//! a [`RunArchive`] and tells a [`Notifier`] when a run finishes. Delivery
//! is at-least-once, so archives see an entry id again after a crash and
//! must treat a repeat as a no-op.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::consumer::{Delivery, EventHandler};
use crate::error::{Error, Result};
use crate::model::event::{EntryId, Lifecycle};
use crate::model::{EventRecord, WorkflowId};

/// Long-term store of a run's events, read back in log order.
#[async_trait]
pub trait RunArchive: Send + Sync {
    async fn append(&self, workflow_id: &WorkflowId, id: EntryId, record: &EventRecord) -> Result<()>;

    async fn read_ordered(&self, workflow_id: &WorkflowId) -> Result<Vec<EventRecord>>;
}

/// Told once per terminal event.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, workflow_id: &WorkflowId, record: &EventRecord) -> Result<()>;
}

/// Archive keyed by entry id, so replays collapse.
#[derive(Default)]
pub struct MemoryArchive {
    runs: Mutex<BTreeMap<WorkflowId, BTreeMap<EntryId, EventRecord>>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunArchive for MemoryArchive {
    async fn append(&self, workflow_id: &WorkflowId, id: EntryId, record: &EventRecord) -> Result<()> {
        self.runs
            .lock()
            .await
            .entry(workflow_id.clone())
            .or_default()
            .insert(id, record.clone());
        Ok(())
    }

    async fn read_ordered(&self, workflow_id: &WorkflowId) -> Result<Vec<EventRecord>> {
        Ok(self
            .runs
            .lock()
            .await
            .get(workflow_id)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Notifier that only logs.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, workflow_id: &WorkflowId, record: &EventRecord) -> Result<()> {
        info!(
            %workflow_id,
            kind = record.kind.as_str(),
            content = record.content.as_deref().unwrap_or(""),
            "run finished"
        );
        Ok(())
    }
}

pub struct ArchiveForwarder {
    archive: Arc<dyn RunArchive>,
    notifier: Arc<dyn Notifier>,
}

impl ArchiveForwarder {
    pub fn new(archive: Arc<dyn RunArchive>, notifier: Arc<dyn Notifier>) -> Self {
        Self { archive, notifier }
    }
}

#[async_trait]
impl EventHandler for ArchiveForwarder {
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        match delivery {
            Delivery::Event { id, record } => {
                self.archive.append(&record.workflow_id, *id, record).await?;
                match record.kind.lifecycle() {
                    Some(Lifecycle::Completed | Lifecycle::Error) => {
                        self.notifier.notify(&record.workflow_id, record).await?;
                    }
                    _ => debug!(workflow_id = %record.workflow_id, entry = %id, "archived"),
                }
                Ok(())
            }
            // Left pending so it stays visible to operators.
            Delivery::Malformed { id, error, .. } => Err(Error::MalformedEvent(format!(
                "entry {id}: {error}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _: &WorkflowId, _: &EventRecord) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(id: i64, kind: EventKind) -> Delivery {
        Delivery::Event {
            id: EntryId(id),
            record: EventRecord::new(kind, "w1".into()).content(kind.as_str()),
        }
    }

    #[tokio::test]
    async fn archives_in_order_and_notifies_on_terminal() {
        let archive = Arc::new(MemoryArchive::new());
        let notifier = Arc::new(CountingNotifier::default());
        let forwarder = ArchiveForwarder::new(archive.clone(), notifier.clone());

        for d in [
            event(1, EventKind::WorkflowStarted),
            event(2, EventKind::Status),
            event(3, EventKind::WorkflowCompleted),
        ] {
            forwarder.handle(&d).await.unwrap();
        }
        // A replay after a crash is a no-op.
        forwarder.handle(&event(2, EventKind::Status)).await.unwrap();

        let kinds: Vec<_> = archive
            .read_ordered(&"w1".into())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::WorkflowStarted, EventKind::Status, EventKind::WorkflowCompleted]
        );
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_entries_are_rejected() {
        let forwarder = ArchiveForwarder::new(Arc::new(MemoryArchive::new()), Arc::new(LogNotifier));
        let err = forwarder
            .handle(&Delivery::Malformed {
                id: EntryId(7),
                raw: "{".into(),
                error: "eof".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }
}
