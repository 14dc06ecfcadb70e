//! Durable job queue on a PostgreSQL table.
//!
//! Each message is a row of `conversion_queue`. Claiming a message sets a
//! lease (`lease_expires_at`); until the lease expires no other consumer can
//! claim it. Acknowledging deletes the row. A consumer that dies without
//! acknowledging lets the lease run out, after which the message is handed
//! out again with a higher `delivery_count`.
//!
//! The claim `UPDATE` runs in its own task. A `next()` future dropped while
//! the claim is in flight leaves the task running; the next call picks up
//! its result, and a consumer dropped or closed first hands the row back
//! instead of letting it sit out a full lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use transcoda_core::defaults::{
    QUEUE_LEASE_SECS, QUEUE_NAME, QUEUE_POLL_INTERVAL_MS, QUEUE_PREFETCH,
};
use transcoda_core::{
    Acker, ConversionJob, Delivery, Error, JobQueue, QueueConsumer, QueueDepth, Result,
};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name shared by producers and consumers.
    pub queue_name: String,
    /// How long a claimed message stays invisible before redelivery.
    pub lease: Duration,
    /// Safety-net poll interval when no publish notification arrives.
    pub poll_interval: Duration,
    /// Default unacked deliveries per consumer.
    pub prefetch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: QUEUE_NAME.to_string(),
            lease: Duration::from_secs(QUEUE_LEASE_SECS),
            poll_interval: Duration::from_millis(QUEUE_POLL_INTERVAL_MS),
            prefetch: QUEUE_PREFETCH,
        }
    }
}

impl QueueConfig {
    /// Load from environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUEUE_NAME` | `conversion_requests` | Queue name |
    /// | `QUEUE_PREFETCH` | `1` | Unacked deliveries per consumer |
    /// | `QUEUE_LEASE_SECS` | `1800` | Redelivery lease |
    /// | `QUEUE_POLL_INTERVAL_MS` | `500` | Poll interval |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_name: std::env::var("QUEUE_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.queue_name),
            lease: std::env::var("QUEUE_LEASE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease),
            poll_interval: std::env::var("QUEUE_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            prefetch: std::env::var("QUEUE_PREFETCH")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.prefetch),
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

struct Shared {
    pool: Pool<Postgres>,
    config: QueueConfig,
    /// Wakes in-process consumers on publish.
    notify: Notify,
    closed: AtomicBool,
}

/// PostgreSQL implementation of [`JobQueue`].
#[derive(Clone)]
pub struct PgJobQueue {
    shared: Arc<Shared>,
}

impl PgJobQueue {
    pub fn new(pool: Pool<Postgres>, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                config,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Make every consumer of this handle return `None` from `next()`.
    /// Messages stay in the table for other processes.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Enqueue a raw body without job serialization.
    pub async fn publish_raw(&self, body: &[u8]) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO conversion_queue (id, queue_name, payload, enqueued_at, delivery_count)
             VALUES ($1, $2, $3, $4, 0)",
        )
        .bind(id)
        .bind(&self.shared.config.queue_name)
        .bind(body)
        .bind(Utc::now())
        .execute(&self.shared.pool)
        .await
        .map_err(|e| Error::Queue(format!("publish failed: {}", e)))?;

        self.shared.notify.notify_waiters();
        debug!(
            subsystem = "queue",
            component = "pg_queue",
            op = "publish",
            message_id = %id,
            queue = %self.shared.config.queue_name,
            "Message published"
        );
        Ok(id)
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn publish(&self, job: &ConversionJob) -> Result<()> {
        let body = job.to_bytes()?;
        self.publish_raw(&body).await?;
        Ok(())
    }

    async fn consume(
        &self,
        consumer_tag: &str,
        prefetch: usize,
    ) -> Result<Box<dyn QueueConsumer>> {
        if prefetch == 0 {
            return Err(Error::InvalidInput("prefetch must be at least 1".into()));
        }
        debug!(
            subsystem = "queue",
            component = "pg_queue",
            op = "consume",
            consumer = consumer_tag,
            prefetch,
            "Consumer registered"
        );
        Ok(Box::new(PgConsumer {
            shared: self.shared.clone(),
            tag: consumer_tag.to_string(),
            prefetch: Arc::new(Semaphore::new(prefetch)),
            pending: None,
        }))
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let (ready, in_flight): (i64, i64) = sqlx::query_as(
            "SELECT
                COUNT(*) FILTER (WHERE lease_expires_at IS NULL OR lease_expires_at < $2),
                COUNT(*) FILTER (WHERE lease_expires_at >= $2)
             FROM conversion_queue
             WHERE queue_name = $1",
        )
        .bind(&self.shared.config.queue_name)
        .bind(Utc::now())
        .fetch_one(&self.shared.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueDepth { ready, in_flight })
    }
}

/// A claimed row: id, payload, delivery count.
type Claimed = (Uuid, Vec<u8>, i32);

struct PgConsumer {
    shared: Arc<Shared>,
    tag: String,
    prefetch: Arc<Semaphore>,
    /// Claim started by a `next()` call that was dropped before it finished.
    pending: Option<JoinHandle<Result<Option<Claimed>>>>,
}

async fn claim(shared: Arc<Shared>, tag: String) -> Result<Option<Claimed>> {
    let now = Utc::now();
    let lease = chrono::Duration::from_std(shared.config.lease)
        .map_err(|e| Error::Config(format!("lease out of range: {}", e)))?;

    let row: Option<Claimed> = sqlx::query_as(
        "UPDATE conversion_queue
         SET consumer_tag = $2, lease_expires_at = $3, delivery_count = delivery_count + 1
         WHERE id = (
             SELECT id FROM conversion_queue
             WHERE queue_name = $1
               AND (lease_expires_at IS NULL OR lease_expires_at < $4)
             ORDER BY enqueued_at ASC, id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
         )
         RETURNING id, payload, delivery_count",
    )
    .bind(&shared.config.queue_name)
    .bind(&tag)
    .bind(now + lease)
    .bind(now)
    .fetch_optional(&shared.pool)
    .await
    .map_err(|e| Error::Queue(format!("claim failed: {}", e)))?;

    Ok(row)
}

/// Hand a claimed but undelivered row back to the queue.
async fn release(pool: &Pool<Postgres>, id: Uuid, delivery_count: i32) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE conversion_queue
         SET consumer_tag = NULL, lease_expires_at = NULL, delivery_count = delivery_count - 1
         WHERE id = $1 AND delivery_count = $2",
    )
    .bind(id)
    .bind(delivery_count)
    .execute(pool)
    .await
    .map_err(|e| Error::Queue(format!("release failed: {}", e)))?;
    Ok(result.rows_affected() > 0)
}

impl PgConsumer {
    /// Release whatever an abandoned claim ends up holding.
    fn release_pending(&mut self) {
        let Some(handle) = self.pending.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            handle.abort();
            return;
        };
        let pool = self.shared.pool.clone();
        let tag = self.tag.clone();
        runtime.spawn(async move {
            let Ok(Ok(Some((id, _, delivery_count)))) = handle.await else {
                return;
            };
            match release(&pool, id, delivery_count).await {
                Ok(released) => debug!(
                    subsystem = "queue",
                    component = "pg_queue",
                    op = "release",
                    message_id = %id,
                    consumer = %tag,
                    released,
                    "Abandoned claim handed back"
                ),
                Err(e) => warn!(
                    subsystem = "queue",
                    component = "pg_queue",
                    op = "release",
                    message_id = %id,
                    consumer = %tag,
                    error = %e,
                    "Abandoned claim could not be released; it redelivers after the lease"
                ),
            }
        });
    }
}

impl Drop for PgConsumer {
    fn drop(&mut self) {
        self.release_pending();
    }
}

#[async_trait]
impl QueueConsumer for PgConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let permit = self
            .prefetch
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Queue("consumer closed".into()))?;

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                self.release_pending();
                return Ok(None);
            }

            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (shared, tag) = (&self.shared, &self.tag);
            let handle = self
                .pending
                .get_or_insert_with(|| tokio::spawn(claim(shared.clone(), tag.clone())));
            let joined = handle.await;
            self.pending = None;
            let claimed =
                joined.map_err(|e| Error::Queue(format!("claim task failed: {}", e)))??;

            if let Some((id, body, delivery_count)) = claimed {
                let delivery_count = delivery_count.max(1) as u32;
                if delivery_count > 1 {
                    warn!(
                        subsystem = "queue",
                        component = "pg_queue",
                        op = "claim",
                        message_id = %id,
                        consumer = %self.tag,
                        delivery_count,
                        "Redelivering message after lease expiry"
                    );
                } else {
                    debug!(
                        subsystem = "queue",
                        component = "pg_queue",
                        op = "claim",
                        message_id = %id,
                        consumer = %self.tag,
                        "Message claimed"
                    );
                }
                let acker = PgAcker {
                    pool: self.shared.pool.clone(),
                    id,
                    delivery_count: delivery_count as i32,
                };
                return Ok(Some(
                    Delivery::new(id, body, delivery_count, Box::new(acker))
                        .with_prefetch_permit(permit),
                ));
            }

            trace!(
                subsystem = "queue",
                component = "pg_queue",
                consumer = %self.tag,
                "Queue empty, waiting"
            );
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.shared.config.poll_interval) => {}
            }
        }
    }
}

struct PgAcker {
    pool: Pool<Postgres>,
    id: Uuid,
    delivery_count: i32,
}

#[async_trait]
impl Acker for PgAcker {
    async fn ack(&self) -> Result<()> {
        // Matching on delivery_count keeps a stale ack from deleting a message
        // that was re-claimed after our lease expired.
        let result =
            sqlx::query("DELETE FROM conversion_queue WHERE id = $1 AND delivery_count = $2")
                .bind(self.id)
                .bind(self.delivery_count)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Queue(format!("ack failed: {}", e)))?;

        if result.rows_affected() == 0 {
            warn!(
                subsystem = "queue",
                component = "pg_queue",
                op = "ack",
                message_id = %self.id,
                "Ack matched no message; lease was lost to another consumer"
            );
        } else {
            debug!(
                subsystem = "queue",
                component = "pg_queue",
                op = "ack",
                message_id = %self.id,
                "Message acknowledged"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.queue_name, "conversion_requests");
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.lease, Duration::from_secs(1800));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_queue_config_builders() {
        let config = QueueConfig::default()
            .with_queue_name("test_queue")
            .with_lease(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(20));
        assert_eq!(config.queue_name, "test_queue");
        assert_eq!(config.lease, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
    }
}
