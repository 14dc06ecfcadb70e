//! Collaborator traits for the conversion pipeline.
//!
//! The orchestrator and worker only see these traits; PostgreSQL, filesystem,
//! and in-memory implementations live in their own modules and crates.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Durable records for audio artifacts and conversion requests.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert the source audio row and a `queued` request in one transaction.
    async fn create_request(&self, req: CreateRequest) -> Result<Uuid>;

    /// Move exactly one request to `status`.
    ///
    /// Returns `RequestNotFound` when no row has this id and
    /// `InvalidTransition` when the current status does not permit the move.
    /// `target_id` must be present for `Done` and absent otherwise.
    async fn update_request_status(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        target_id: Option<Uuid>,
    ) -> Result<()>;

    /// Insert a new immutable audio row.
    async fn insert_audio(&self, name: &str, format: &str, location: &str) -> Result<Uuid>;

    /// Insert the target audio row (`id = location = target_id`) and mark the
    /// request `done` in one transaction.
    async fn record_conversion(
        &self,
        request_id: Uuid,
        target_id: Uuid,
        name: &str,
        format: &str,
    ) -> Result<()>;

    /// Fetch a request by id.
    async fn get_request(&self, request_id: Uuid) -> Result<Request>;

    /// All requests of a user, oldest first.
    async fn get_request_history(&self, user_id: Uuid) -> Result<Vec<HistoryEntry>>;

    /// Fetch an audio row by id, `NoSuchAudio` if absent.
    async fn get_audio_by_id(&self, id: Uuid) -> Result<Audio>;
}

/// User accounts referenced by requests.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user; a taken username yields `AlreadyExists`.
    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<Uuid>;

    /// Look up stored credentials; `NoSuchUser` if absent.
    async fn get_user_credentials(&self, username: &str) -> Result<UserCredentials>;
}

/// Argument check shared by every `update_request_status` implementation.
pub fn validate_status_update(status: RequestStatus, target_id: Option<Uuid>) -> Result<()> {
    match (status.requires_target(), target_id) {
        (true, None) => Err(Error::InvalidInput(format!(
            "status {} requires a target id",
            status
        ))),
        (false, Some(_)) => Err(Error::InvalidInput(format!(
            "status {} must not carry a target id",
            status
        ))),
        _ => Ok(()),
    }
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Durable at-least-once channel from submission to workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Serialize and durably enqueue a job.
    async fn publish(&self, job: &ConversionJob) -> Result<()>;

    /// Register a manual-ack consumer holding at most `prefetch` unacked
    /// deliveries.
    async fn consume(&self, consumer_tag: &str, prefetch: usize)
        -> Result<Box<dyn QueueConsumer>>;

    /// Ready and in-flight message counts.
    async fn depth(&self) -> Result<QueueDepth>;
}

/// A registered consumer.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Next delivery. Waits while `prefetch` deliveries are unacked.
    /// `None` once the queue is closed.
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

/// Acknowledges one delivery against its backing queue.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// A message handed to a consumer, removed from the queue only by [`Delivery::ack`].
pub struct Delivery {
    pub message_id: Uuid,
    pub body: Vec<u8>,
    /// How many times this message has been handed out, this one included.
    pub delivery_count: u32,
    acker: Box<dyn Acker>,
    // Released after the acker, so the prefetch slot frees only once acked.
    _prefetch: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    pub fn new(message_id: Uuid, body: Vec<u8>, delivery_count: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            message_id,
            body,
            delivery_count,
            acker,
            _prefetch: None,
        }
    }

    /// Attach the consumer's prefetch permit.
    pub fn with_prefetch_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self._prefetch = Some(permit);
        self
    }

    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    /// Remove the message permanently.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("bytes", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

// =============================================================================
// OBJECT STORE
// =============================================================================

/// Opaque put/get/presign interface for media bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store everything read from `reader` under `key`, returning the byte count.
    async fn upload(&self, key: &str, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<u64>;

    /// Copy the object at `key` to the local path `dest`.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Time-limited download URL for `key`.
    fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Upload a local file.
    async fn upload_file(&self, key: &str, path: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        self.upload(key, &mut file).await
    }
}

// =============================================================================
// ENCODER
// =============================================================================

/// External transcoder reading `input` and writing `output`.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, input: &Path, output: &Path) -> Result<()>;
}
