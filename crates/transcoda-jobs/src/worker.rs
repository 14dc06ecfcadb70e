//! Queue worker: consumes conversion jobs and runs them through the converter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use transcoda_core::defaults::{
    CONVERSION_MAX_CONCURRENT, EVENT_BUS_CAPACITY, QUEUE_NAME, QUEUE_PREFETCH,
};
use transcoda_core::{ConversionJob, Delivery, Error, JobQueue, RequestStatus, Result};

use crate::converter::{Converter, ProcessOutcome};
use crate::limiter::{ConversionLimiter, ConversionPermit};

/// Pause after a queue error before asking for the next delivery.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for the queue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of consumer loops.
    pub consumers: usize,
    /// Unacked deliveries each consumer may hold.
    pub prefetch: usize,
    /// Used as the consumer tag prefix.
    pub queue_name: String,
    /// Whether to process jobs at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumers: CONVERSION_MAX_CONCURRENT,
            prefetch: QUEUE_PREFETCH,
            queue_name: QUEUE_NAME.to_string(),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `WORKER_CONSUMERS` | `CONVERSION_MAX_CONCURRENT` | Consumer loops |
    /// | `QUEUE_PREFETCH` | `1` | Unacked deliveries per consumer |
    /// | `QUEUE_NAME` | `conversion_requests` | Queue name |
    pub fn from_env() -> Self {
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let default_consumers = std::env::var("CONVERSION_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(CONVERSION_MAX_CONCURRENT);

        let consumers = std::env::var("WORKER_CONSUMERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(default_consumers)
            .max(1);

        let prefetch = std::env::var("QUEUE_PREFETCH")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(QUEUE_PREFETCH)
            .max(1);

        let queue_name = std::env::var("QUEUE_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| QUEUE_NAME.to_string());

        Self {
            consumers,
            prefetch,
            queue_name,
            enabled,
        }
    }

    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers.max(1);
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the queue worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    /// A job was handed to the converter.
    JobStarted {
        request_id: Uuid,
        delivery_count: u32,
    },
    /// A job finished with its request `done`.
    JobCompleted { request_id: Uuid, target_id: Uuid },
    /// The request was already terminal.
    JobSkipped {
        request_id: Uuid,
        status: RequestStatus,
    },
    /// A job failed.
    JobFailed { request_id: Uuid, error: String },
    /// A message could not be decoded and was dropped.
    MessageRejected { message_id: Uuid, error: String },
    /// Worker stopped.
    WorkerStopped,
}

/// One-shot shutdown flag that async waiters can observe.
#[derive(Default)]
struct ShutdownSignal {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: Arc<ShutdownSignal>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop taking new deliveries. In-flight jobs finish and are acked.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait until every consumer loop and in-flight job has finished.
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("worker task failed: {}", e)))
    }
}

/// Consumes jobs from a [`JobQueue`] and runs them through a [`Converter`].
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    converter: Arc<Converter>,
    limiter: ConversionLimiter,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        converter: Arc<Converter>,
        limiter: ConversionLimiter,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            queue,
            converter,
            limiter,
            config,
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the consumer loops and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let shutdown = Arc::new(ShutdownSignal::default());
        let event_rx = self.event_tx.subscribe();
        let worker = Arc::new(self);

        let join = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        WorkerHandle {
            shutdown,
            event_rx,
            join,
        }
    }

    async fn run(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) {
        if !self.config.enabled {
            info!("Conversion worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            op = "start",
            consumers = self.config.consumers,
            prefetch = self.config.prefetch,
            max_concurrent = self.limiter.capacity(),
            queue = %self.config.queue_name,
            "Conversion worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let mut loops = JoinSet::new();
        for n in 0..self.config.consumers {
            let tag = format!("{}-{}-{}", self.config.queue_name, std::process::id(), n);
            let worker = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { worker.consume_loop(tag, shutdown).await });
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Consumer loop panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(
            subsystem = "jobs",
            component = "worker",
            op = "stop",
            "Conversion worker stopped"
        );
    }

    /// One consumer: permit, then delivery, then a spawned job task.
    async fn consume_loop(self: Arc<Self>, tag: String, shutdown: Arc<ShutdownSignal>) {
        let mut consumer = match self.queue.consume(&tag, self.config.prefetch).await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(consumer = %tag, error = %e, "Failed to register consumer");
                return;
            }
        };

        let mut jobs = JoinSet::new();

        loop {
            while let Some(result) = jobs.try_join_next() {
                if let Err(e) = result {
                    error!(error = ?e, "Job task panicked");
                }
            }

            // A consumer at its prefetch limit must not sit on a limiter
            // permit another consumer could use.
            while jobs.len() >= self.config.prefetch {
                if let Some(Err(e)) = jobs.join_next().await {
                    error!(error = ?e, "Job task panicked");
                }
            }

            if shutdown.is_triggered() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                permit = self.limiter.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(consumer = %tag, error = %e, "Limiter unavailable");
                        break;
                    }
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = consumer.next() => next,
            };

            let delivery = match delivery {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    debug!(consumer = %tag, "Queue closed");
                    break;
                }
                Err(e) => {
                    drop(permit);
                    error!(consumer = %tag, error = %e, "Failed to receive delivery");
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let job = match ConversionJob::from_bytes(&delivery.body) {
                Ok(job) => job,
                Err(e) => {
                    drop(permit);
                    self.reject(delivery, e).await;
                    continue;
                }
            };

            let worker = self.clone();
            jobs.spawn(async move { worker.run_job(job, delivery, permit).await });
        }

        // Graceful drain: in-flight jobs still finish and ack.
        while let Some(result) = jobs.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Job task panicked");
            }
        }
        debug!(consumer = %tag, "Consumer loop exited");
    }

    async fn reject(&self, delivery: Delivery, cause: Error) {
        let message_id = delivery.message_id;
        warn!(
            subsystem = "jobs",
            component = "worker",
            op = "decode",
            message_id = %message_id,
            error = %cause,
            "Dropping malformed message"
        );
        if let Err(e) = delivery.ack().await {
            error!(message_id = %message_id, error = %e, "Failed to ack malformed message");
        }
        let _ = self.event_tx.send(WorkerEvent::MessageRejected {
            message_id,
            error: cause.to_string(),
        });
    }

    /// Process one job, release its slot, then ack regardless of outcome.
    async fn run_job(&self, job: ConversionJob, delivery: Delivery, permit: ConversionPermit) {
        let request_id = job.request_id;
        let delivery_count = delivery.delivery_count;

        info!(
            subsystem = "jobs",
            component = "worker",
            op = "process",
            request_id = %request_id,
            redelivered = delivery.redelivered(),
            "Processing conversion job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            request_id,
            delivery_count,
        });

        let result = self.converter.process(&job).await;
        drop(permit);

        let event = match result {
            Ok(ProcessOutcome::Completed { target_id }) => WorkerEvent::JobCompleted {
                request_id,
                target_id,
            },
            Ok(ProcessOutcome::AlreadyFinished { status }) => {
                WorkerEvent::JobSkipped { request_id, status }
            }
            Err(e) => WorkerEvent::JobFailed {
                request_id,
                error: e.to_string(),
            },
        };

        // Failures are terminal at this layer; the message is never retried.
        if let Err(e) = delivery.ack().await {
            error!(request_id = %request_id, error = %e, "Failed to ack delivery");
        }
        let _ = self.event_tx.send(event);
    }
}
