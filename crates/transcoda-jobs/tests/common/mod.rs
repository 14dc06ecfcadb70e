//! Shared fixtures: in-memory collaborators and a scripted encoder.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{broadcast, Semaphore};
use uuid::Uuid;

use transcoda_jobs::{
    ConversionJob, ConversionLimiter, Converter, ConverterConfig, Encoder, Error, MemoryJobQueue,
    MemoryJobStore, MemoryObjectStore, QueueWorker, Result, SubmitRequest, Submitter, UserStore,
    WorkerConfig, WorkerEvent,
};

pub const SOURCE_BYTES: &[u8] = b"ID3 not really an mp3";

/// Output format the scripted encoder refuses, like ffmpeg with an unknown muxer.
pub const UNSUPPORTED_FORMAT: &str = "xyz";

/// Encoder double: prefixes the input bytes, optionally waiting on a gate.
#[derive(Default)]
pub struct ScriptedEncoder {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every encode blocks until the returned semaphore gets a permit for it.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let encoder = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (encoder, gate)
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn encode(&self, input: &Path, output: &Path) -> Result<()> {
        let format = output.extension().and_then(|e| e.to_str()).unwrap_or("");
        if format == UNSUPPORTED_FORMAT {
            return Err(Error::Conversion(format!(
                "Unable to choose an output format for '{}'",
                output.display()
            )));
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| Error::Conversion("gate closed".into()))?
                .forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut bytes = b"encoded:".to_vec();
        bytes.extend(tokio::fs::read(input).await?);
        tokio::fs::write(output, bytes).await?;
        Ok(())
    }
}

/// In-memory pipeline with one registered user.
pub struct Harness {
    pub store: MemoryJobStore,
    pub objects: MemoryObjectStore,
    pub queue: MemoryJobQueue,
    pub encoder: Arc<ScriptedEncoder>,
    pub user_id: Uuid,
    dir: TempDir,
}

impl Harness {
    pub async fn new(encoder: ScriptedEncoder) -> Self {
        let store = MemoryJobStore::new();
        let user_id = store.insert_user("listener", "$argon2id$stub").await.unwrap();
        Self {
            store,
            objects: MemoryObjectStore::new(),
            queue: MemoryJobQueue::new(),
            encoder: Arc::new(encoder),
            user_id,
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    pub fn converter_config(&self) -> ConverterConfig {
        ConverterConfig::default().with_scratch_dir(self.scratch_dir())
    }

    pub fn converter(&self) -> Arc<Converter> {
        self.converter_with(self.converter_config())
    }

    pub fn converter_with(&self, config: ConverterConfig) -> Arc<Converter> {
        Arc::new(Converter::new(
            Arc::new(self.store.clone()),
            Arc::new(self.objects.clone()),
            self.encoder.clone(),
            config,
        ))
    }

    pub fn submitter(&self) -> Submitter {
        Submitter::new(
            Arc::new(self.store.clone()),
            Arc::new(self.objects.clone()),
            Arc::new(self.queue.clone()),
            self.scratch_dir(),
        )
    }

    pub fn worker(&self, limit: usize, config: WorkerConfig) -> QueueWorker {
        QueueWorker::new(
            Arc::new(self.queue.clone()),
            self.converter(),
            ConversionLimiter::new(limit),
            config,
        )
    }

    /// Write a local source file named `filename` and return its path.
    pub async fn source_file(&self, filename: &str) -> PathBuf {
        let dir = self.dir.path().join("inputs").join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(filename);
        tokio::fs::write(&path, SOURCE_BYTES).await.unwrap();
        path
    }

    pub fn submit_request(&self, path: PathBuf, filename: &str, target: &str) -> SubmitRequest {
        let source_format = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp3")
            .to_string();
        SubmitRequest {
            source_path: path,
            filename: filename.to_string(),
            source_format,
            target_format: target.to_string(),
            user_id: self.user_id,
        }
    }

    /// Submit `filename` for conversion to `target` through the real submission path.
    pub async fn submit(&self, filename: &str, target: &str) -> Uuid {
        let path = self.source_file(filename).await;
        self.submitter()
            .submit(self.submit_request(path, filename, target))
            .await
            .unwrap()
    }

    /// Jobs still sitting in the queue, in order.
    pub fn published_jobs(&self) -> Vec<ConversionJob> {
        self.queue
            .ready_bodies()
            .iter()
            .map(|b| ConversionJob::from_bytes(b).unwrap())
            .collect()
    }

    pub fn job_for(&self, request_id: Uuid) -> ConversionJob {
        self.published_jobs()
            .into_iter()
            .find(|j| j.request_id == request_id)
            .unwrap()
    }

    /// Files left behind in the scratch directory.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.scratch_dir()) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn is_job_outcome(event: &WorkerEvent) -> bool {
    matches!(
        event,
        WorkerEvent::JobCompleted { .. }
            | WorkerEvent::JobFailed { .. }
            | WorkerEvent::JobSkipped { .. }
    )
}

/// Collect events until `done` says stop, failing the test after ten seconds.
pub async fn collect_events<F>(
    events: &mut broadcast::Receiver<WorkerEvent>,
    mut done: F,
) -> Vec<WorkerEvent>
where
    F: FnMut(&[WorkerEvent]) -> bool,
{
    let mut seen = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        while !done(&seen) {
            seen.push(events.recv().await.unwrap());
        }
    })
    .await;
    assert!(finished.is_ok(), "timed out waiting for worker events; saw {:?}", seen);
    seen
}

/// Collect events until `n` jobs reached an outcome.
pub async fn collect_outcomes(
    events: &mut broadcast::Receiver<WorkerEvent>,
    n: usize,
) -> Vec<WorkerEvent> {
    collect_events(events, |seen| {
        seen.iter().filter(|e| is_job_outcome(e)).count() >= n
    })
    .await
}

/// Poll `cond` until it holds, failing the test after ten seconds.
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}
