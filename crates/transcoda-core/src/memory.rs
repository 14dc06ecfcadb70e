//! In-memory collaborators for tests.
//!
//! [`MemoryJobStore`], [`MemoryJobQueue`] and [`MemoryObjectStore`] follow
//! the same contracts as the PostgreSQL and filesystem implementations, plus
//! a few knobs for injecting failures and inspecting state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected(what: &str) -> Error {
    Error::Internal(format!("injected failure: {}", what))
}

// =============================================================================
// JOB STORE
// =============================================================================

#[derive(Default)]
struct StoreState {
    audio: HashMap<Uuid, Audio>,
    requests: HashMap<Uuid, Request>,
    users: HashMap<String, UserCredentials>,
    transitions: Vec<(Uuid, RequestStatus)>,
    fail_on: HashSet<RequestStatus>,
    fail_record: bool,
}

/// [`JobStore`] and [`UserStore`] backed by hash maps.
#[derive(Default, Clone)]
pub struct MemoryJobStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `update_request_status(_, status, _)` fail.
    pub fn fail_status_updates_to(&self, status: RequestStatus) {
        lock(&self.state).fail_on.insert(status);
    }

    /// Make `record_conversion` fail before writing anything.
    pub fn fail_record_conversion(&self) {
        lock(&self.state).fail_record = true;
    }

    pub fn audio_count(&self) -> usize {
        lock(&self.state).audio.len()
    }

    pub fn audio_rows(&self) -> Vec<Audio> {
        lock(&self.state).audio.values().cloned().collect()
    }

    /// Every committed status change of `request_id`, in order.
    pub fn transitions(&self, request_id: Uuid) -> Vec<RequestStatus> {
        lock(&self.state)
            .transitions
            .iter()
            .filter(|(id, _)| *id == request_id)
            .map(|(_, s)| *s)
            .collect()
    }

    fn apply_transition(
        state: &mut StoreState,
        request_id: Uuid,
        status: RequestStatus,
        target_id: Option<Uuid>,
    ) -> Result<()> {
        let request = state
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        if !request.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: request.status,
                to: status,
            });
        }
        request.status = status;
        request.target_id = target_id;
        request.updated = Utc::now();
        state.transitions.push((request_id, status));
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_request(&self, req: CreateRequest) -> Result<Uuid> {
        let mut state = lock(&self.state);
        let source_id = Uuid::new_v4();
        state.audio.insert(
            source_id,
            Audio {
                id: source_id,
                name: req.name.clone(),
                format: req.source_format.clone(),
                location: req.source_location,
            },
        );
        let id = Uuid::new_v4();
        let now = Utc::now();
        state.requests.insert(
            id,
            Request {
                id,
                user_id: req.user_id,
                audio_name: req.name,
                source_id,
                source_format: req.source_format,
                target_id: None,
                target_format: req.target_format,
                status: RequestStatus::Queued,
                created: now,
                updated: now,
            },
        );
        state.transitions.push((id, RequestStatus::Queued));
        Ok(id)
    }

    async fn update_request_status(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        target_id: Option<Uuid>,
    ) -> Result<()> {
        validate_status_update(status, target_id)?;
        let mut state = lock(&self.state);
        if state.fail_on.contains(&status) {
            return Err(injected("update_request_status"));
        }
        Self::apply_transition(&mut state, request_id, status, target_id)
    }

    async fn insert_audio(&self, name: &str, format: &str, location: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        lock(&self.state).audio.insert(
            id,
            Audio {
                id,
                name: name.to_string(),
                format: format.to_string(),
                location: location.to_string(),
            },
        );
        Ok(id)
    }

    async fn record_conversion(
        &self,
        request_id: Uuid,
        target_id: Uuid,
        name: &str,
        format: &str,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_record || state.fail_on.contains(&RequestStatus::Done) {
            return Err(injected("record_conversion"));
        }
        if state.audio.contains_key(&target_id) {
            return Err(Error::AlreadyExists(format!("audio {}", target_id)));
        }
        // Transition first so a refusal leaves no audio row behind.
        Self::apply_transition(&mut state, request_id, RequestStatus::Done, Some(target_id))?;
        state.audio.insert(
            target_id,
            Audio {
                id: target_id,
                name: name.to_string(),
                format: format.to_string(),
                location: target_id.to_string(),
            },
        );
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Request> {
        lock(&self.state)
            .requests
            .get(&request_id)
            .cloned()
            .ok_or(Error::RequestNotFound(request_id))
    }

    async fn get_request_history(&self, user_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let state = lock(&self.state);
        let mut rows: Vec<HistoryEntry> = state
            .requests
            .values()
            .filter(|r| r.user_id == user_id)
            .map(|r| HistoryEntry {
                id: r.id,
                audio_name: state
                    .audio
                    .get(&r.source_id)
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| r.audio_name.clone()),
                source_format: r.source_format.clone(),
                target_format: r.target_format.clone(),
                created: r.created,
                updated: r.updated,
                status: r.status,
            })
            .collect();
        rows.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn get_audio_by_id(&self, id: Uuid) -> Result<Audio> {
        lock(&self.state)
            .audio
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchAudio(id))
    }
}

#[async_trait]
impl UserStore for MemoryJobStore {
    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<Uuid> {
        let mut state = lock(&self.state);
        if state.users.contains_key(username) {
            return Err(Error::AlreadyExists(format!("user {}", username)));
        }
        let id = Uuid::new_v4();
        state.users.insert(
            username.to_string(),
            UserCredentials {
                id,
                password_hash: password_hash.to_string(),
            },
        );
        Ok(id)
    }

    async fn get_user_credentials(&self, username: &str) -> Result<UserCredentials> {
        lock(&self.state)
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| Error::NoSuchUser(username.to_string()))
    }
}

// =============================================================================
// JOB QUEUE
// =============================================================================

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: Uuid,
    body: Vec<u8>,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    in_flight: usize,
    acked: usize,
    closed: bool,
    fail_publish: bool,
}

#[derive(Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// [`JobQueue`] held in process memory.
///
/// A delivery dropped without ack goes back to the front of the queue with
/// its delivery count kept, which stands in for a broker redelivering after
/// a consumer dies.
#[derive(Default, Clone)]
pub struct MemoryJobQueue {
    inner: Arc<QueueInner>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an arbitrary body, bypassing job serialization.
    pub fn push_raw(&self, body: impl Into<Vec<u8>>) {
        lock(&self.inner.state).ready.push_back(QueuedMessage {
            id: Uuid::new_v4(),
            body: body.into(),
            delivery_count: 0,
        });
        self.inner.notify.notify_waiters();
    }

    /// Stop handing out messages once the ready list is drained.
    pub fn close(&self) {
        lock(&self.inner.state).closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Make `publish` fail.
    pub fn fail_publish(&self, fail: bool) {
        lock(&self.inner.state).fail_publish = fail;
    }

    pub fn acked(&self) -> usize {
        lock(&self.inner.state).acked
    }

    pub fn ready_bodies(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.state)
            .ready
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn publish(&self, job: &ConversionJob) -> Result<()> {
        let body = job.to_bytes()?;
        {
            let state = lock(&self.inner.state);
            if state.fail_publish {
                return Err(Error::Queue("injected failure: publish".to_string()));
            }
            if state.closed {
                return Err(Error::Queue("queue closed".to_string()));
            }
        }
        self.push_raw(body);
        Ok(())
    }

    async fn consume(
        &self,
        _consumer_tag: &str,
        prefetch: usize,
    ) -> Result<Box<dyn QueueConsumer>> {
        if prefetch == 0 {
            return Err(Error::InvalidInput("prefetch must be at least 1".into()));
        }
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            prefetch: Arc::new(Semaphore::new(prefetch)),
        }))
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let state = lock(&self.inner.state);
        Ok(QueueDepth {
            ready: state.ready.len() as i64,
            in_flight: state.in_flight as i64,
        })
    }
}

struct MemoryConsumer {
    inner: Arc<QueueInner>,
    prefetch: Arc<Semaphore>,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let permit = self
            .prefetch
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Queue("consumer closed".into()))?;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.inner.state);
                if let Some(mut msg) = state.ready.pop_front() {
                    msg.delivery_count += 1;
                    state.in_flight += 1;
                    let delivery = Delivery::new(
                        msg.id,
                        msg.body.clone(),
                        msg.delivery_count,
                        Box::new(MemoryAcker {
                            inner: self.inner.clone(),
                            message: Mutex::new(Some(msg)),
                            acked: AtomicBool::new(false),
                        }),
                    );
                    return Ok(Some(delivery.with_prefetch_permit(permit)));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    inner: Arc<QueueInner>,
    message: Mutex<Option<QueuedMessage>>,
    acked: AtomicBool,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.message).take();
        let mut state = lock(&self.inner.state);
        state.in_flight = state.in_flight.saturating_sub(1);
        state.acked += 1;
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if self.acked.load(Ordering::SeqCst) {
            return;
        }
        if let Some(msg) = lock(&self.message).take() {
            let mut state = lock(&self.inner.state);
            state.in_flight = state.in_flight.saturating_sub(1);
            state.ready.push_front(msg);
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }
}

// =============================================================================
// OBJECT STORE
// =============================================================================

#[derive(Default)]
struct ObjectState {
    objects: HashMap<String, Vec<u8>>,
    fail_upload: bool,
    fail_download: bool,
}

/// [`ObjectStore`] keeping objects in a hash map.
#[derive(Default, Clone)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<ObjectState>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        lock(&self.state)
            .objects
            .insert(key.to_string(), bytes.into());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.state).objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.state).objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn fail_uploads(&self, fail: bool) {
        lock(&self.state).fail_upload = fail;
    }

    pub fn fail_downloads(&self, fail: bool) {
        lock(&self.state).fail_download = fail;
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, key: &str, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<u64> {
        if lock(&self.state).fail_upload {
            return Err(Error::Storage("injected failure: upload".into()));
        }
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        let len = buf.len() as u64;
        self.put(key, buf);
        Ok(len)
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let bytes = {
            let state = lock(&self.state);
            if state.fail_download {
                return Err(Error::Storage("injected failure: download".into()));
            }
            state
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("object {}", key)))?
        };
        Ok(crate::staging::write_into_place(dest, &bytes).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(lock(&self.state).objects.contains_key(key))
    }

    fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://{}?ttl={}", key, ttl.as_secs()))
    }
}
