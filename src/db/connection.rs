//! Role-scoped connections to the backing store.
//!
//! Every component asks for a connection by [`Role`]. Non-blocking roles
//! share a cached pool per role; blocking roles (anything that waits on
//! LISTEN) get their own dedicated listener connection so a long wait never
//! starves a short command. Each SSE client gets a fresh ephemeral listener
//! that is closed when the stream ends.

use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::backoff::RetryPolicy;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Run lookups, log reads, consumer-group bookkeeping.
    General,
    /// Log appends and live-channel publishes.
    Publisher,
    /// Live-channel subscriptions. Blocking.
    Subscriber,
    /// Job records and pgmq operations.
    Queue,
    /// Worker wake-ups. Blocking.
    Worker,
    /// Log-append wake-ups for blocking group reads. Blocking.
    Events,
}

impl Role {
    /// Blocking roles wait on notifications and never share a connection.
    pub fn is_blocking(self) -> bool {
        matches!(self, Role::Subscriber | Role::Worker | Role::Events)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::General => "general",
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Queue => "queue",
            Role::Worker => "worker",
            Role::Events => "events",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection tuning.
#[derive(Debug, Clone, Copy)]
pub struct DbSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Attempts for establishing a connection, and for each command issued
    /// on a non-blocking role.
    pub max_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            max_attempts: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// A long-lived listener connection owned by one blocking role.
pub type Dedicated = Arc<Mutex<PgListener>>;

/// Creates and caches connections for one database.
///
/// Constructed once at startup and passed to whoever needs it.
pub struct ConnectionManager {
    url: SecretString,
    settings: DbSettings,
    pools: Mutex<HashMap<Role, PgPool>>,
    dedicated: Mutex<HashMap<Role, Dedicated>>,
}

impl ConnectionManager {
    pub fn new(url: SecretString, settings: DbSettings) -> Self {
        Self {
            url,
            settings,
            pools: Mutex::new(HashMap::new()),
            dedicated: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    /// The cached pool for a non-blocking role, connecting on first use.
    pub async fn pool(&self, role: Role) -> Result<PgPool> {
        if role.is_blocking() {
            return Err(Error::Config(format!(
                "role {role} is blocking and needs a dedicated connection"
            )));
        }
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&role) {
            return Ok(pool.clone());
        }
        let options = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .acquire_timeout(self.settings.acquire_timeout);
        let url = self.url.expose_secret();
        let pool = self
            .connect("pool", role, || {
                let options = options.clone();
                async move { options.connect(url).await.map_err(Error::from) }
            })
            .await?;
        pools.insert(role, pool.clone());
        Ok(pool)
    }

    /// The cached dedicated listener for a blocking role.
    pub async fn dedicated(&self, role: Role) -> Result<Dedicated> {
        if !role.is_blocking() {
            return Err(Error::Config(format!(
                "role {role} is not blocking; use a pooled connection"
            )));
        }
        let mut dedicated = self.dedicated.lock().await;
        if let Some(conn) = dedicated.get(&role) {
            return Ok(conn.clone());
        }
        let listener = self.listener(role).await?;
        let conn = Arc::new(Mutex::new(listener));
        dedicated.insert(role, conn.clone());
        Ok(conn)
    }

    /// A fresh subscriber connection for one client, never cached.
    ///
    /// The caller owns it and must drop it when the client goes away.
    pub async fn create_ephemeral_subscriber(&self) -> Result<PgListener> {
        self.listener(Role::Subscriber).await
    }

    /// Run a command with the retry limit of `role`.
    ///
    /// Non-blocking roles give up after `max_attempts`; blocking roles
    /// retry connection failures indefinitely.
    pub async fn retrying<T, F, Fut>(&self, role: Role, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limit = (!role.is_blocking()).then_some(self.settings.max_attempts);
        self.settings.retry.run(what, limit, op).await
    }

    /// Close every cached connection.
    pub async fn close(&self) {
        let pools: Vec<_> = self.pools.lock().await.drain().collect();
        for (role, pool) in pools {
            pool.close().await;
            debug!(role = %role, "pool closed");
        }
        self.dedicated.lock().await.clear();
        info!("store connections closed");
    }

    async fn listener(&self, role: Role) -> Result<PgListener> {
        let url = self.url.expose_secret();
        self.connect("listener", role, || async move {
            PgListener::connect(url).await.map_err(Error::from)
        })
        .await
    }

    async fn connect<T, F, Fut>(&self, kind: &str, role: Role, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self
            .settings
            .retry
            .run("connect", Some(self.settings.max_attempts), op)
            .await?;
        metrics::connections_opened().add(1, &[KeyValue::new("role", role.as_str())]);
        debug!(role = %role, kind, "store connection opened");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_roles() {
        assert!(Role::Subscriber.is_blocking());
        assert!(Role::Worker.is_blocking());
        assert!(Role::Events.is_blocking());
        assert!(!Role::General.is_blocking());
        assert!(!Role::Publisher.is_blocking());
        assert!(!Role::Queue.is_blocking());
    }

    #[tokio::test]
    async fn roles_are_routed_to_the_right_connection_kind() {
        let manager = ConnectionManager::new(
            SecretString::from("postgres://localhost/unused"),
            DbSettings::default(),
        );
        assert!(matches!(manager.pool(Role::Worker).await, Err(Error::Config(_))));
        assert!(matches!(
            manager.dedicated(Role::Queue).await,
            Err(Error::Config(_))
        ));
    }
}
