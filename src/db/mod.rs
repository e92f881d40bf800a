//! Postgres backend: connections, migrations, and the store implementations.
//!
//! Jobs live in `queue_jobs` and are dispatched through pgmq queues. Run
//! logs live in `event_log`; consumer-group cursors and pending entries in
//! `consumer_groups` / `consumer_pending`. LISTEN/NOTIFY provides wake-ups
//! and the live status channel.

pub mod backoff;
pub mod connection;
pub mod events;
pub mod jobs;
mod listen;
pub mod live;
pub mod pgmq;

pub use connection::{ConnectionManager, DbSettings, Role};

use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use listen::Wakeups;

/// NOTIFY channel for "a job was enqueued or became visible"; payload is the queue name.
pub const JOB_READY_CHANNEL: &str = "job_ready";
/// NOTIFY channel for log appends; payload is the workflow id.
pub const EVENT_APPENDED_CHANNEL: &str = "event_appended";

/// Database handle. Owns the role pools and the blocking listeners.
pub struct Db {
    conn: Arc<ConnectionManager>,
    general: PgPool,
    publisher: PgPool,
    queue: PgPool,
    job_wakeups: OnceCell<Wakeups>,
    event_wakeups: OnceCell<Wakeups>,
    shutdown: CancellationToken,
}

impl Db {
    /// Open the non-blocking pools. Listeners are connected on first use.
    pub async fn connect(conn: Arc<ConnectionManager>) -> Result<Self> {
        let general = conn.pool(Role::General).await?;
        let publisher = conn.pool(Role::Publisher).await?;
        let queue = conn.pool(Role::Queue).await?;
        Ok(Self {
            conn,
            general,
            publisher,
            queue,
            job_wakeups: OnceCell::new(),
            event_wakeups: OnceCell::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.general)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.general).await?;
        Ok(())
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.conn
    }

    /// Stop the listeners and close every connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.conn.close().await;
    }

    async fn job_wakeups(&self) -> Result<&Wakeups> {
        self.job_wakeups
            .get_or_try_init(|| self.start_wakeups(Role::Worker, JOB_READY_CHANNEL))
            .await
    }

    async fn event_wakeups(&self) -> Result<&Wakeups> {
        self.event_wakeups
            .get_or_try_init(|| self.start_wakeups(Role::Events, EVENT_APPENDED_CHANNEL))
            .await
    }

    async fn start_wakeups(&self, role: Role, channel: &'static str) -> Result<Wakeups> {
        let conn = self.conn.dedicated(role).await?;
        Wakeups::start(
            conn,
            channel,
            self.conn.settings().retry,
            self.shutdown.child_token(),
        )
        .await
    }
}

#[async_trait::async_trait]
impl crate::store::HealthCheck for Db {
    async fn health_check(&self) -> Result<()> {
        Db::health_check(self).await
    }
}
