//! Worker queues.
//!
//! The relay publishes prompt requests to one queue and consumes worker
//! results (and their dead-letter queue) from another. Semantics follow a
//! hosted message queue: receive long-polls up to `wait`, a received message
//! stays hidden for the visibility timeout, and only an explicit
//! [`QueueConsumer::delete`] acknowledges it. Undeleted messages are
//! redelivered; after `max_receive_count` receives they move to the
//! dead-letter queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use tokio::time::Instant;

use crate::errors::{Result, StoreError};
use crate::sqlite::ConnectionPool;
use crate::sqlite::repositories::{QueueRepo, Redrive};

/// A message handed out by [`QueueConsumer::receive`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    /// Stable message ID.
    pub id: i64,
    /// Receipt for [`QueueConsumer::delete`]; changes on every receive.
    pub receipt: String,
    /// Raw body (an encoded event envelope).
    pub body: String,
    /// Receives so far, including this one.
    pub receive_count: u32,
}

/// Sending side of a queue.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Enqueue a body.
    async fn publish(&self, body: String) -> Result<()>;
}

/// Receiving side of a queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Queue name, for logs.
    fn name(&self) -> &str;

    /// Wait up to `wait` for at least one message; return at most `max`.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>>;

    /// Acknowledge a received message.
    async fn delete(&self, receipt: &str) -> Result<()>;
}

/// Dead-letter routing for a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedrivePolicy {
    /// Queue exhausted messages move to.
    pub dead_letter_queue: String,
    /// Receives allowed before the move.
    pub max_receive_count: u32,
}

/// Configuration for one [`SqliteQueue`].
#[derive(Clone, Debug)]
pub struct SqliteQueueConfig {
    /// Queue name.
    pub name: String,
    /// How long a received message stays hidden.
    pub visibility_timeout: Duration,
    /// Sleep between empty polls while long-polling.
    pub poll_interval: Duration,
    /// Dead-letter routing, if any.
    pub redrive: Option<RedrivePolicy>,
}

impl SqliteQueueConfig {
    /// Defaults for `name`: 30 s visibility, 100 ms poll, no redrive.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            redrive: None,
        }
    }
}

/// Queue stored in the relay's `SQLite` database.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: ConnectionPool,
    config: SqliteQueueConfig,
}

impl SqliteQueue {
    /// Bind a queue name to a migrated pool.
    pub fn new(pool: ConnectionPool, config: SqliteQueueConfig) -> Self {
        Self { pool, config }
    }

    /// Messages in the queue, visible or in flight.
    pub async fn depth(&self) -> Result<usize> {
        let name = self.config.name.clone();
        self.with_conn(move |conn| QueueRepo::depth(conn, &name)).await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("queue task failed: {e}")))?
    }

    async fn claim(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let name = self.config.name.clone();
        let redrive = self.config.redrive.clone();
        let visibility_ms = i64::try_from(self.config.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let rows = self
            .with_conn(move |conn| {
                let redrive = redrive.as_ref().map(|r| Redrive {
                    dead_letter_queue: &r.dead_letter_queue,
                    max_receive_count: r.max_receive_count,
                });
                QueueRepo::claim(conn, &name, max, Utc::now().timestamp_millis(), visibility_ms, redrive)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| QueueMessage {
                id: row.id,
                receipt: row.receipt,
                body: row.body,
                receive_count: row.receive_count,
            })
            .collect())
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    async fn publish(&self, body: String) -> Result<()> {
        let name = self.config.name.clone();
        let id = self
            .with_conn(move |conn| QueueRepo::enqueue(conn, &name, &body, Utc::now().timestamp_millis()))
            .await?;
        tracing::debug!(queue = %self.config.name, message_id = id, "published");
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for SqliteQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.claim(max).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        let name = self.config.name.clone();
        let owned = receipt.to_owned();
        if self.with_conn(move |conn| QueueRepo::delete(conn, &name, &owned)).await? {
            Ok(())
        } else {
            Err(StoreError::UnknownReceipt {
                queue: self.config.name.clone(),
                receipt: receipt.to_owned(),
            })
        }
    }
}
