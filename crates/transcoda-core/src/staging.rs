//! Local files that appear whole or not at all.
//!
//! The converter trusts a file at a staging path to be a complete copy of
//! its object. Writers fill a hidden sibling and rename it over the
//! destination, so a crash mid-write leaves only a `.tmp` behind.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Hidden, uniquely named temp file next to `dest`.
pub fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}

async fn place<F, Fut>(dest: &Path, fill: F) -> io::Result<u64>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: std::future::Future<Output = io::Result<u64>>,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_sibling(dest);
    let result = match fill(temp.clone()).await {
        Ok(bytes) => tokio::fs::rename(&temp, dest).await.map(|()| bytes),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

/// Copy `src` to `dest` through a temp sibling.
pub async fn copy_into_place(src: &Path, dest: &Path) -> io::Result<u64> {
    let src = src.to_path_buf();
    place(dest, |temp| async move { tokio::fs::copy(&src, &temp).await }).await
}

/// Write `bytes` to `dest` through a temp sibling.
pub async fn write_into_place(dest: &Path, bytes: &[u8]) -> io::Result<u64> {
    place(dest, |temp| async move {
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(bytes.len() as u64)
    })
    .await
}
