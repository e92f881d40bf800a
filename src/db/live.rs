//! Live status channel over LISTEN/NOTIFY.
//!
//! Publishing is a plain `pg_notify` on the publisher pool. Every
//! subscription owns its own ephemeral listener connection, released when
//! the subscription is closed or dropped.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tracing::debug;

use super::Role;
use crate::error::Result;
use crate::store::{LiveChannel, Subscription};

/// Postgres rejects NOTIFY payloads at or above 8000 bytes.
pub const MAX_NOTIFY_PAYLOAD: usize = 7999;

#[async_trait]
impl LiveChannel for super::Db {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.conn
            .retrying(Role::Publisher, "live.publish", || async move {
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(channel)
                    .bind(payload)
                    .execute(&self.publisher)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let mut listener = self.conn.create_ephemeral_subscriber().await?;
        listener.listen(channel).await?;
        debug!(channel, "live subscription opened");
        Ok(Box::new(PgSubscription {
            listener: Some(listener),
            channel: channel.to_string(),
        }))
    }
}

struct PgSubscription {
    listener: Option<PgListener>,
    channel: String,
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn next_message(&mut self) -> Result<Option<String>> {
        let Some(listener) = self.listener.as_mut() else {
            return Ok(None);
        };
        let notification = listener.recv().await?;
        Ok(Some(notification.payload().to_string()))
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if let Some(listener) = self.listener.as_mut() {
            listener.unlisten(&self.channel).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.listener.take().is_some() {
            debug!(channel = %self.channel, "live subscription closed");
        }
        Ok(())
    }
}
