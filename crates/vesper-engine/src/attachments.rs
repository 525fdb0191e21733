use std::path::{Path, PathBuf};

use anyhow::Result;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::validate::MAX_ATTACHMENT_BYTES;
use vesper_types::error::{SendError, ValidationError};
use vesper_types::models::AttachmentRef;

/// Blob intake for message attachments. Uploads happen before the send so
/// the message payload only carries references.
pub trait AttachmentStore: Send + Sync {
    fn store(&self, mime: String, data: Vec<u8>)
    -> BoxFuture<'_, Result<AttachmentRef, SendError>>;
}

/// Content-addressed blobs on the local filesystem. Each blob lives at
/// `{dir}/{sha256-hex}`; identical bytes collapse to one file, so a retried
/// upload is a no-op.
pub struct FsAttachmentStore {
    dir: PathBuf,
}

impl FsAttachmentStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("attachment storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// On-disk path for a stored digest. Rejects anything that is not a
    /// bare hex digest, so URLs can never escape the storage directory.
    pub fn blob_path(&self, digest: &str) -> Option<PathBuf> {
        let valid = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
        valid.then(|| self.dir.join(digest))
    }

    pub async fn read(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.blob_path(digest) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_blob(&self, mime: String, data: Vec<u8>) -> Result<AttachmentRef, SendError> {
        let byte_len = data.len() as u64;
        if byte_len > MAX_ATTACHMENT_BYTES {
            return Err(ValidationError::AttachmentTooLarge {
                index: 0,
                max: MAX_ATTACHMENT_BYTES,
                got: byte_len,
            }
            .into());
        }

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let digest = hex::encode(hasher.finalize());
        let path = self.dir.join(&digest);

        if !exists(&path).await.map_err(io_storage)? {
            // Write to a temp name first so a crash mid-write never leaves
            // a truncated blob at its final address.
            let tmp = self.dir.join(format!("{digest}.{}.tmp", Uuid::new_v4()));
            fs::write(&tmp, &data).await.map_err(io_storage)?;
            fs::rename(&tmp, &path).await.map_err(io_storage)?;
            debug!("stored attachment blob {digest} ({byte_len} bytes)");
        }

        Ok(AttachmentRef {
            id: Uuid::new_v4(),
            url: format!("/attachments/{digest}"),
            byte_len,
            mime,
        })
    }
}

impl AttachmentStore for FsAttachmentStore {
    fn store(
        &self,
        mime: String,
        data: Vec<u8>,
    ) -> BoxFuture<'_, Result<AttachmentRef, SendError>> {
        Box::pin(self.store_blob(mime, data))
    }
}

async fn exists(path: &Path) -> std::io::Result<bool> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn io_storage(e: std::io::Error) -> SendError {
    SendError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, FsAttachmentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttachmentStore::new(dir.path().join("blobs")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn store_and_read_round_trip() {
        let (_dir, store) = store().await;
        let blob = b"fake png bytes".to_vec();

        let attachment = store
            .store_blob("image/png".into(), blob.clone())
            .await
            .unwrap();
        assert_eq!(attachment.byte_len, blob.len() as u64);
        assert_eq!(attachment.mime, "image/png");

        let digest = attachment.url.rsplit('/').next().unwrap();
        assert_eq!(store.read(digest).await.unwrap(), Some(blob));
    }

    #[tokio::test]
    async fn identical_bytes_share_one_blob() {
        let (_dir, store) = store().await;
        let blob = b"same bytes".to_vec();

        let first = store.store_blob("image/png".into(), blob.clone()).await.unwrap();
        let second = store.store_blob("image/png".into(), blob).await.unwrap();

        // Distinct references, one address on disk.
        assert_ne!(first.id, second.id);
        assert_eq!(first.url, second.url);
    }

    #[tokio::test]
    async fn oversize_blob_is_rejected() {
        let (_dir, store) = store().await;
        let blob = vec![0u8; (MAX_ATTACHMENT_BYTES + 1) as usize];
        let result = store.store_blob("video/mp4".into(), blob).await;
        assert!(matches!(
            result,
            Err(SendError::Validation(ValidationError::AttachmentTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn path_traversal_digests_are_refused() {
        let (_dir, store) = store().await;
        assert!(store.blob_path("../../etc/passwd").is_none());
        assert!(store.blob_path("short").is_none());
        assert_eq!(store.read("../../etc/passwd").await.unwrap(), None);
    }
}
