//! Fan-out of NOTIFY payloads from one dedicated listener.
//!
//! A blocking role owns a single listener connection; many in-process
//! waiters share it through a broadcast channel and filter on the payload.

use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::RetryPolicy;
use super::connection::Dedicated;
use crate::error::Result;

const FANOUT_CAPACITY: usize = 256;

pub(crate) struct Wakeups {
    tx: broadcast::Sender<String>,
}

impl Wakeups {
    /// LISTEN on `channel` and forward every payload until `shutdown`.
    pub async fn start(
        conn: Dedicated,
        channel: &'static str,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        conn.lock().await.listen(channel).await?;
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let sender = tx.clone();
        tokio::spawn(async move {
            let mut listener = conn.lock().await;
            forward(&mut listener, channel, &sender, retry, shutdown).await;
            debug!(channel, "listener stopped");
        });
        Ok(Self { tx })
    }

    /// Start waiting before checking for work, so nothing in between is missed.
    pub fn waiter(&self) -> Waiter {
        Waiter {
            rx: self.tx.subscribe(),
        }
    }
}

pub(crate) struct Waiter {
    rx: broadcast::Receiver<String>,
}

impl Waiter {
    /// Wait for a notification whose payload equals `key`, or `timeout`.
    pub async fn wait_for(mut self, key: &str, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                match self.rx.recv().await {
                    Ok(payload) if payload == key => return,
                    Ok(_) => {}
                    // Missed some; the caller re-checks anyway.
                    Err(RecvError::Lagged(_)) => return,
                    // Listener gone; fall back to the timeout as a poll interval.
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        })
        .await;
    }
}

async fn forward(
    listener: &mut PgListener,
    channel: &'static str,
    tx: &broadcast::Sender<String>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
) {
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = listener.recv() => match received {
                Ok(notification) => {
                    failures = 0;
                    let _ = tx.send(notification.payload().to_string());
                }
                Err(e) => {
                    // PgListener reconnects and re-LISTENs on the next recv.
                    let delay = retry.delay(failures);
                    warn!(channel, error = %e, delay_ms = delay.as_millis() as u64, "listener connection lost");
                    failures = failures.saturating_add(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
