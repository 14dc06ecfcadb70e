//! Filesystem object store with signed download URLs.
//!
//! Objects live flat under a root directory at `{root}/{key}`, where keys
//! follow the `"{id}.{format}"` convention. Uploads and downloads both go to
//! a temp file first and are renamed into place, so neither the store nor a
//! scratch directory ever holds a partial object.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use transcoda_core::defaults::{STORAGE_PATH, STORAGE_PUBLIC_URL};
use transcoda_core::{staging, Error, ObjectStore, Result};

type HmacSha256 = Hmac<Sha256>;

/// Object store configuration.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub root: PathBuf,
    pub public_base_url: String,
    pub signing_key: String,
}

impl ObjectStoreConfig {
    /// Load from environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STORAGE_PATH` | `/var/lib/transcoda/objects` | Root directory |
    /// | `STORAGE_PUBLIC_URL` | `http://localhost:8000/objects` | Base of presigned URLs |
    /// | `STORAGE_SIGNING_KEY` | (required) | HMAC secret for presigned URLs |
    pub fn from_env() -> Result<Self> {
        let signing_key = std::env::var("STORAGE_SIGNING_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config("STORAGE_SIGNING_KEY must be set".into()))?;
        Ok(Self {
            root: std::env::var("STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(STORAGE_PATH)),
            public_base_url: std::env::var("STORAGE_PUBLIC_URL")
                .unwrap_or_else(|_| STORAGE_PUBLIC_URL.to_string()),
            signing_key,
        })
    }
}

/// [`ObjectStore`] backed by a local directory.
pub struct FilesystemObjectStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: Vec<u8>,
}

impl FilesystemObjectStore {
    pub fn new(config: ObjectStoreConfig) -> Self {
        Self {
            root: config.root,
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            signing_key: config.signing_key.into_bytes(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its path, refusing anything that could escape the root.
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
            || key.starts_with('.')
        {
            return Err(Error::InvalidInput(format!("invalid object key: {:?}", key)));
        }
        Ok(self.root.join(key))
    }

    fn signature(&self, key: &str, expires: u64) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| Error::Config(format!("invalid signing key: {}", e)))?;
        mac.update(format!("{}:{}", key, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Presigned URL expiring at the unix time `expires`.
    pub fn presigned_url_at(&self, key: &str, expires: u64) -> Result<String> {
        self.object_path(key)?;
        let signature = self.signature(key, expires)?;
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.public_base_url, key, expires, signature
        ))
    }

    /// Check a presigned URL's parameters against the unix time `now`.
    pub fn verify_presigned(&self, key: &str, expires: u64, signature: &str, now: u64) -> bool {
        if now > expires {
            return false;
        }
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.signing_key) else {
            return false;
        };
        mac.update(format!("{}:{}", key, expires).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn upload(&self, key: &str, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<u64> {
        let full_path = self.object_path(key)?;
        fs::create_dir_all(&self.root).await.map_err(|e| {
            warn!(root = %self.root.display(), error = %e, "object_store: create_dir_all failed");
            e
        })?;

        let temp_path = self.root.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await?;
        let bytes = match tokio::io::copy(reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(Error::Storage(format!("upload of {} failed: {}", key, e)));
            }
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "object_store: rename failed");
            e
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        debug!(
            subsystem = "storage",
            component = "object_store",
            op = "upload",
            key,
            bytes,
            "Object stored"
        );
        Ok(bytes)
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let full_path = self.object_path(key)?;
        if !fs::try_exists(&full_path).await? {
            return Err(Error::NotFound(format!("object {}", key)));
        }
        let bytes = staging::copy_into_place(&full_path, dest)
            .await
            .map_err(|e| Error::Storage(format!("download of {} failed: {}", key, e)))?;

        debug!(
            subsystem = "storage",
            component = "object_store",
            op = "download",
            key,
            bytes,
            dest = %dest.display(),
            "Object fetched"
        );
        Ok(bytes)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.object_path(key)?;
        Ok(fs::try_exists(full_path).await?)
    }

    fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.presigned_url_at(key, unix_now() + ttl.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FilesystemObjectStore {
        FilesystemObjectStore::new(ObjectStoreConfig {
            root: dir.path().to_path_buf(),
            public_base_url: "https://media.test/objects/".into(),
            signing_key: "secret".into(),
        })
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut reader: &[u8] = b"ID3 audio";

        let written = store.upload("abc.mp3", &mut reader).await.unwrap();
        assert_eq!(written, 9);
        assert!(store.exists("abc.mp3").await.unwrap());

        let dest = dir.path().join("scratch").join("abc.mp3");
        let read = store.download("abc.mp3", &dest).await.unwrap();
        assert_eq!(read, 9);
        assert_eq!(fs::read(&dest).await.unwrap(), b"ID3 audio");
    }

    #[tokio::test]
    async fn test_upload_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut reader: &[u8] = b"x";
        store.upload("a.wav", &mut reader).await.unwrap();

        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["a.wav".to_string()]);
    }

    #[tokio::test]
    async fn test_download_replaces_partial_staged_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut reader: &[u8] = b"ID3 full track";
        store.upload("abc.mp3", &mut reader).await.unwrap();

        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).await.unwrap();
        let dest = scratch.join("abc.mp3");
        fs::write(&dest, b"ID3").await.unwrap();

        store.download("abc.mp3", &dest).await.unwrap();
        assert_eq!(fs::read(&dest).await.unwrap(), b"ID3 full track");
        let mut entries = fs::read_dir(&scratch).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["abc.mp3".to_string()]);
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store
            .download("missing.mp3", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for key in ["../etc/passwd", "a/b.mp3", "..", "", ".hidden"] {
            let mut reader: &[u8] = b"x";
            assert!(
                matches!(
                    store.upload(key, &mut reader).await,
                    Err(Error::InvalidInput(_))
                ),
                "key {:?} should be rejected",
                key
            );
        }
    }

    #[test]
    fn test_presigned_url_format() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let url = store.presigned_url_at("abc.wav", 1_700_000_000).unwrap();
        assert!(url.starts_with("https://media.test/objects/abc.wav?expires=1700000000&signature="));
        let signature = url.rsplit("signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_verify_presigned() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let expires = 1_700_000_900;
        let url = store.presigned_url_at("abc.wav", expires).unwrap();
        let signature = url.rsplit("signature=").next().unwrap();

        assert!(store.verify_presigned("abc.wav", expires, signature, expires - 1));
        assert!(!store.verify_presigned("abc.wav", expires, signature, expires + 1));
        assert!(!store.verify_presigned("other.wav", expires, signature, expires - 1));
        assert!(!store.verify_presigned("abc.wav", expires + 60, signature, expires - 1));
        assert!(!store.verify_presigned("abc.wav", expires, "zz", expires - 1));
    }

    #[test]
    fn test_presigned_url_uses_ttl() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let before = unix_now();
        let url = store
            .presigned_url("abc.wav", Duration::from_secs(900))
            .unwrap();
        let expires: u64 = url
            .split("expires=")
            .nth(1)
            .and_then(|s| s.split('&').next())
            .unwrap()
            .parse()
            .unwrap();
        assert!(expires >= before + 900 && expires <= unix_now() + 900);
    }
}
