//! Filesystem blob store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{digest_str, validate_name, BlobStore};
use crate::store::StoreError;

/// Blob store rooted at a local directory.
///
/// Blobs are sharded by the first two hex digits of the SHA-256 of their
/// name. Writes go to a temporary file that is renamed into place, so a
/// reader never observes a partially written blob.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    writable: bool,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writable: true,
        }
    }

    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writable: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        let shard = &digest_str(name)[..2];
        Ok(self.root.join(shard).join(name))
    }

    fn uri_for(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn describe(&self) -> String {
        format!("local {} (writable: {})", self.root.display(), self.writable)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn locate(&self, name: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(name)?;
        if tokio::fs::try_exists(&path).await? {
            Ok(Some(Self::uri_for(&path)))
        } else {
            Ok(None)
        }
    }

    async fn upload(&self, source: &Path, name: &str) -> Result<String, StoreError> {
        let path = self.path_for(name)?;
        if tokio::fs::try_exists(&path).await? {
            tracing::debug!(name = %name, "Blob already stored");
            return Ok(Self::uri_for(&path));
        }
        if !self.writable {
            return Err(StoreError::missing_credentials(format!("upload {name}")));
        }

        let shard = path
            .parent()
            .ok_or_else(|| StoreError::Backend(format!("no shard directory for {name}")))?;
        tokio::fs::create_dir_all(shard).await?;

        let staging = shard.join(format!(".{name}.{}.tmp", Uuid::new_v4()));
        if let Err(e) = tokio::fs::copy(source, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        tracing::debug!(name = %name, path = %path.display(), "Stored blob");
        Ok(Self::uri_for(&path))
    }

    async fn download(&self, name: &str, destination: &Path) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        tokio::fs::copy(&path, destination).await?;
        Ok(())
    }
}
