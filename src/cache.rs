//! Content-addressed stage cache.
//!
//! Every item gets a stable key, the SHA-256 of its natural identifier (the
//! video locator). A stage's artifact lives in the blob store under a name
//! derived from that key, so a re-run after a partial failure finds the
//! finished work and skips straight past it.

use std::path::Path;
use std::sync::Arc;

use crate::blob::{digest_str, BlobStore};
use crate::collaborators::Representation;
use crate::store::StoreError;

/// Stable per-item cache key.
pub fn item_key(natural_id: &str) -> String {
    digest_str(natural_id)
}

pub fn audio_name(key: &str) -> String {
    format!("{key}_audio.wav")
}

pub fn transcript_name(key: &str, representation: Representation) -> String {
    format!("{key}_transcript_{}.json", representation.suffix())
}

/// Blob-store probe in front of each expensive stage.
#[derive(Clone)]
pub struct StageCache {
    blobs: Arc<dyn BlobStore>,
}

impl StageCache {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// URI of a cached artifact. A miss is `Ok(None)`, not an error.
    pub async fn probe(&self, name: &str) -> Result<Option<String>, StoreError> {
        let hit = self.blobs.locate(name).await?;
        match &hit {
            Some(uri) => tracing::debug!(name = %name, uri = %uri, "Cache hit"),
            None => tracing::debug!(name = %name, "Cache miss"),
        }
        Ok(hit)
    }

    /// First hit in priority order, with its position in `names`.
    pub async fn probe_first(
        &self,
        names: &[String],
    ) -> Result<Option<(usize, String)>, StoreError> {
        for (index, name) in names.iter().enumerate() {
            if let Some(uri) = self.probe(name).await? {
                return Ok(Some((index, uri)));
            }
        }
        Ok(None)
    }

    /// Store a freshly produced artifact under its cache name.
    pub async fn store(&self, path: &Path, name: &str) -> Result<String, StoreError> {
        self.blobs.upload(path, name).await
    }

    /// Copy a cached artifact out of the store.
    pub async fn fetch(&self, name: &str, destination: &Path) -> Result<(), StoreError> {
        self.blobs.download(name, destination).await
    }
}
