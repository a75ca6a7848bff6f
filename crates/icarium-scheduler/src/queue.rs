//! Push notification queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use icarium_config::QueueConfig;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Interval between polls while waiting for messages.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters for one queue read.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub max_messages: u32,
    pub wait_time: Duration,
}

impl From<&QueueConfig> for ReadOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_messages: config.max_messages,
            wait_time: config.wait_time,
        }
    }
}

/// A message body exactly as it came off the queue.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: String,
    pub body: String,
}

/// Result of one read. An empty batch is normal, not a failure.
#[derive(Debug, Clone, Default)]
pub struct QueueBatch {
    /// Position after this batch, if the transport exposes one.
    pub cursor: Option<String>,
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue transport error: {0}")]
    Transport(String),
}

/// Source of push notifications.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Read up to `options.max_messages` messages, waiting at most
    /// `options.wait_time` for the first one to arrive.
    async fn read(&self, options: &ReadOptions) -> Result<QueueBatch, QueueError>;
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: uuid::Uuid,
    body: String,
    enqueued_at: DateTime<Utc>,
    seq: i64,
}

/// Oldest first; `seq` breaks ties between rows enqueued at the same instant.
fn sort_claimed(rows: &mut [MessageRow]) {
    rows.sort_by_key(|r| (r.enqueued_at, r.seq));
}

/// Queue backed by the `build_messages` table.
///
/// Messages are removed as they are read, so each is delivered at most once.
pub struct PgMessageQueue {
    pool: PgPool,
}

impl PgMessageQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim and remove the oldest pending messages.
    /// Uses SKIP LOCKED so several dispatchers can share the table.
    async fn claim(&self, limit: u32) -> Result<Vec<MessageRow>, QueueError> {
        let mut rows = sqlx::query_as::<_, MessageRow>(
            r#"
            DELETE FROM build_messages
            WHERE id IN (
                SELECT id FROM build_messages
                ORDER BY enqueued_at ASC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            RETURNING id, body, enqueued_at, seq
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order.
        sort_claimed(&mut rows);
        Ok(rows)
    }
}

#[async_trait]
impl QueueClient for PgMessageQueue {
    async fn read(&self, options: &ReadOptions) -> Result<QueueBatch, QueueError> {
        let deadline = Instant::now() + options.wait_time;

        loop {
            let rows = self.claim(options.max_messages).await?;
            let now = Instant::now();

            if !rows.is_empty() || now >= deadline {
                return Ok(QueueBatch {
                    cursor: rows.last().map(|r| r.id.to_string()),
                    messages: rows
                        .into_iter()
                        .map(|r| RawMessage {
                            id: r.id.to_string(),
                            body: r.body,
                        })
                        .collect(),
                });
            }

            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
