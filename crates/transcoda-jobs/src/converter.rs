//! Conversion orchestrator.
//!
//! Drives one request through `processing → done | failed`:
//!
//! 1. mark the request `processing`
//! 2. stage the source file locally (download if needed)
//! 3. pick a fresh target id
//! 4. run the encoder
//! 5. upload the target file
//! 6. record the target audio row and mark the request `done`
//!
//! Any failure in steps 2–6 runs a single compensation step that marks the
//! request `failed`. A failure in step 1 aborts without touching state.
//!
//! A request found already `processing` belongs to a consumer that died
//! mid-job. Its staged source may be a partial leftover, so the resumed job
//! always fetches a fresh copy from the object store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use transcoda_core::defaults::{CONVERSION_TIMEOUT_SECS, SCRATCH_SUBDIR};
use transcoda_core::{
    object_key, ConversionJob, Encoder, Error, JobStore, ObjectStore, RequestStatus, Result,
};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Local directory for staged sources and encoder output.
    pub scratch_dir: PathBuf,
    /// Deadline for steps 2–6 of one job.
    pub job_timeout: Option<Duration>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join(SCRATCH_SUBDIR),
            job_timeout: Some(Duration::from_secs(CONVERSION_TIMEOUT_SECS)),
        }
    }
}

impl ConverterConfig {
    /// Load from environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SCRATCH_DIR` | `$TMPDIR/transcoda` | Local scratch directory |
    /// | `CONVERSION_TIMEOUT_SECS` | `600` | Per-job deadline, `0` disables; workers clamp it to the queue lease |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let scratch_dir = std::env::var("SCRATCH_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.scratch_dir);
        let job_timeout = match std::env::var("CONVERSION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.job_timeout,
        };
        Self {
            scratch_dir,
            job_timeout,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Keep the job deadline inside the queue lease.
    ///
    /// A job that outlives its lease is redelivered while still running, and
    /// a second consumer would resume it concurrently. A missing deadline or
    /// one at or past `lease` is clamped to nine tenths of the lease.
    pub fn bounded_by_lease(mut self, lease: Duration) -> Self {
        let limit = lease - lease / 10;
        match self.job_timeout {
            Some(timeout) if timeout <= limit => {}
            configured => {
                warn!(
                    subsystem = "jobs",
                    component = "converter",
                    op = "configure",
                    configured_secs = configured.map(|t| t.as_secs()),
                    lease_secs = lease.as_secs(),
                    clamped_secs = limit.as_secs(),
                    "Conversion timeout does not fit inside the queue lease, clamping"
                );
                self.job_timeout = Some(limit);
            }
        }
        self
    }

    /// Local path of `{id}.{format}` inside the scratch directory.
    pub fn scratch_path(&self, id: &str, format: &str) -> PathBuf {
        self.scratch_dir.join(object_key(id, format))
    }
}

/// Result of processing one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The request is now `done` with this target.
    Completed { target_id: Uuid },
    /// The request was already terminal; nothing was changed.
    AlreadyFinished { status: RequestStatus },
}

/// Local files of one job, removed when the guard drops.
struct ScratchFiles {
    paths: Vec<PathBuf>,
}

impl ScratchFiles {
    fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, path: PathBuf) -> &Path {
        self.paths.push(path);
        &self.paths[self.paths.len() - 1]
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
                }
            }
        }
    }
}

/// Ids and formats end up in file names and object keys.
fn validate_component(what: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid {}: {:?}", what, value)))
    }
}

/// Remove a staged file left by an interrupted job.
async fn discard_stale(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(
                subsystem = "jobs",
                component = "converter",
                op = "stage",
                path = %path.display(),
                "Discarded staged source of interrupted job"
            );
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Drives conversion jobs against the store, object store and encoder.
pub struct Converter {
    store: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    encoder: Arc<dyn Encoder>,
    config: ConverterConfig,
}

impl Converter {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        encoder: Arc<dyn Encoder>,
        config: ConverterConfig,
    ) -> Self {
        Self {
            store,
            objects,
            encoder,
            config,
        }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Process one job to a terminal state.
    ///
    /// Returns the pipeline error after the request has been marked `failed`.
    #[instrument(skip(self, job), fields(request_id = %job.request_id, file_id = %job.file_id))]
    pub async fn process(&self, job: &ConversionJob) -> Result<ProcessOutcome> {
        let request_id = job.request_id;

        let resumed = match self
            .store
            .update_request_status(request_id, RequestStatus::Processing, None)
            .await
        {
            Ok(()) => false,
            Err(Error::InvalidTransition { from, .. }) if from.is_terminal() => {
                info!(
                    subsystem = "jobs",
                    component = "converter",
                    op = "start",
                    status = %from,
                    "Request already finished, skipping"
                );
                return Ok(ProcessOutcome::AlreadyFinished { status: from });
            }
            Err(Error::InvalidTransition {
                from: RequestStatus::Processing,
                ..
            }) => {
                warn!(
                    subsystem = "jobs",
                    component = "converter",
                    op = "start",
                    "Request already processing, resuming redelivered job"
                );
                true
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "converter",
                    op = "start",
                    error = %e,
                    "Could not mark request processing"
                );
                return Err(e);
            }
        };

        let start = Instant::now();
        let result = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.pipeline(job, resumed)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "conversion exceeded {}s",
                    limit.as_secs()
                ))),
            },
            None => self.pipeline(job, resumed).await,
        };

        match result {
            Ok(target_id) => {
                info!(
                    subsystem = "jobs",
                    component = "converter",
                    op = "complete",
                    target_id = %target_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Conversion completed"
                );
                Ok(ProcessOutcome::Completed { target_id })
            }
            Err(e) => {
                self.compensate(request_id, &e, start).await;
                Err(e)
            }
        }
    }

    /// Steps 2–6. Scratch files are removed when this returns or is dropped.
    async fn pipeline(&self, job: &ConversionJob, resumed: bool) -> Result<Uuid> {
        validate_component("file id", &job.file_id)?;
        validate_component("source format", &job.source_format)?;
        validate_component("target format", &job.target_format)?;

        let mut scratch = ScratchFiles::new();
        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;

        let source = scratch
            .track(self.config.scratch_path(&job.file_id, &job.source_format))
            .to_path_buf();
        if resumed {
            discard_stale(&source).await?;
        }
        if tokio::fs::try_exists(&source).await? {
            debug!(subsystem = "jobs", component = "converter", op = "stage", "Source already staged");
        } else {
            let bytes = self.objects.download(&job.source_key(), &source).await?;
            debug!(
                subsystem = "jobs",
                component = "converter",
                op = "download",
                bytes,
                "Source downloaded"
            );
        }

        let target_id = Uuid::new_v4();
        let target_key = object_key(&target_id.to_string(), &job.target_format);
        let target = scratch
            .track(self.config.scratch_path(&target_id.to_string(), &job.target_format))
            .to_path_buf();

        self.encoder.encode(&source, &target).await?;

        let bytes = self.objects.upload_file(&target_key, &target).await?;
        debug!(
            subsystem = "jobs",
            component = "converter",
            op = "upload",
            target_id = %target_id,
            bytes,
            "Target uploaded"
        );

        self.store
            .record_conversion(job.request_id, target_id, &job.filename, &job.target_format)
            .await?;

        Ok(target_id)
    }

    /// Best-effort `failed` mark; its own failure is only logged.
    async fn compensate(&self, request_id: Uuid, cause: &Error, start: Instant) {
        match self
            .store
            .update_request_status(request_id, RequestStatus::Failed, None)
            .await
        {
            Ok(()) => error!(
                subsystem = "jobs",
                component = "converter",
                op = "compensate",
                error = %cause,
                duration_ms = start.elapsed().as_millis() as u64,
                "Conversion failed, request marked failed"
            ),
            Err(e) => error!(
                subsystem = "jobs",
                component = "converter",
                op = "compensate",
                error = %cause,
                compensation_error = %e,
                "Conversion failed and request could not be marked failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converter_config_defaults() {
        let config = ConverterConfig::default();
        assert_eq!(config.job_timeout, Some(Duration::from_secs(600)));
        assert!(config.scratch_dir.ends_with("transcoda"));
    }

    #[test]
    fn test_timeout_within_lease_is_kept() {
        let config = ConverterConfig::default().bounded_by_lease(Duration::from_secs(1800));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_timeout_past_lease_is_clamped() {
        let lease = Duration::from_secs(1800);
        let config = ConverterConfig::default()
            .with_job_timeout(Some(Duration::from_secs(3600)))
            .bounded_by_lease(lease);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(1620)));

        let equal = ConverterConfig::default()
            .with_job_timeout(Some(lease))
            .bounded_by_lease(lease);
        assert_eq!(equal.job_timeout, Some(Duration::from_secs(1620)));
    }

    #[test]
    fn test_disabled_timeout_is_bounded_by_lease() {
        let config = ConverterConfig::default()
            .with_job_timeout(None)
            .bounded_by_lease(Duration::from_secs(60));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(54)));
    }

    #[test]
    fn test_scratch_path() {
        let config = ConverterConfig::default().with_scratch_dir("/scratch");
        assert_eq!(
            config.scratch_path("abc", "mp3"),
            PathBuf::from("/scratch/abc.mp3")
        );
    }

    #[test]
    fn test_validate_component() {
        assert!(validate_component("format", "mp3").is_ok());
        assert!(validate_component("file id", &Uuid::new_v4().to_string()).is_ok());
        for bad in ["", "../etc", "a/b", "mp3 ", "x.y"] {
            assert!(
                matches!(validate_component("format", bad), Err(Error::InvalidInput(_))),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn test_scratch_files_removed_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        std::fs::write(&path, b"x").unwrap();
        {
            let mut scratch = ScratchFiles::new();
            scratch.track(path.clone());
            scratch.track(dir.path().join("never-created.wav"));
        }
        assert!(!path.exists());
    }
}
