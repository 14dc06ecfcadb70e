//! Submission path: persist the source, record the request, enqueue the job.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use transcoda_core::{
    object_key, staging, ConversionJob, CreateRequest, Error, JobQueue, JobStore, ObjectStore,
    Result,
};

/// A conversion to submit.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Local file holding the source audio.
    pub source_path: PathBuf,
    /// Display name recorded on the audio rows.
    pub filename: String,
    pub source_format: String,
    pub target_format: String,
    pub user_id: Uuid,
}

fn check_format(what: &str, format: &str) -> Result<()> {
    if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidInput(format!("invalid {}: {:?}", what, format)));
    }
    Ok(())
}

/// Accepts conversion requests and hands them to the queue.
pub struct Submitter {
    store: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn JobQueue>,
    scratch_dir: PathBuf,
}

impl Submitter {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn JobQueue>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            objects,
            queue,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Submit a conversion. The request is `queued` before this returns.
    ///
    /// A publish failure is returned to the caller; the request then stays
    /// `queued` with no message to drive it.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Uuid> {
        check_format("source format", &req.source_format)?;
        check_format("target format", &req.target_format)?;
        if req.filename.trim().is_empty() {
            return Err(Error::InvalidInput("filename must not be empty".into()));
        }

        let file_id = Uuid::new_v4().to_string();
        let key = object_key(&file_id, &req.source_format);

        let bytes = self.objects.upload_file(&key, &req.source_path).await?;
        debug!(
            subsystem = "jobs",
            component = "submitter",
            op = "upload",
            file_id = %file_id,
            bytes,
            "Source uploaded"
        );

        // Staging is an optimization; the converter downloads when it is missing.
        let staged = self.scratch_dir.join(&key);
        let stage_result = match tokio::fs::create_dir_all(&self.scratch_dir).await {
            Ok(()) => staging::copy_into_place(&req.source_path, &staged)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = stage_result {
            debug!(
                subsystem = "jobs",
                component = "submitter",
                op = "stage",
                error = %e,
                "Could not stage source locally"
            );
        }

        let request_id = self
            .store
            .create_request(CreateRequest {
                name: req.filename.clone(),
                source_format: req.source_format.clone(),
                target_format: req.target_format.clone(),
                source_location: file_id.clone(),
                user_id: req.user_id,
            })
            .await?;

        let job = ConversionJob {
            file_id: file_id.clone(),
            filename: req.filename,
            source_format: req.source_format,
            target_format: req.target_format,
            request_id,
        };

        if let Err(e) = self.queue.publish(&job).await {
            error!(
                subsystem = "jobs",
                component = "submitter",
                op = "publish",
                request_id = %request_id,
                error = %e,
                "Request recorded but not enqueued; it will stay queued"
            );
            return Err(e);
        }

        info!(
            subsystem = "jobs",
            component = "submitter",
            op = "submit",
            request_id = %request_id,
            file_id = %file_id,
            "Conversion submitted"
        );
        Ok(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_format() {
        assert!(check_format("format", "mp3").is_ok());
        assert!(check_format("format", "").is_err());
        assert!(check_format("format", "../x").is_err());
        assert!(check_format("format", "m p3").is_err());
    }
}
