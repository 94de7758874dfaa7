//! Blob storage for stage artifacts.
//!
//! Blob writes are existence-checked: uploading to a name that already holds
//! content is a no-op that returns the stored location.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::store::StoreError;

mod http;
mod local;

pub use http::HttpBlobStore;
pub use local::LocalBlobStore;

/// Trait for artifact storage backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend description for logs.
    fn describe(&self) -> String;

    /// Whether this connection may write.
    fn is_writable(&self) -> bool;

    /// URI of the blob stored under `name`, if any.
    async fn locate(&self, name: &str) -> Result<Option<String>, StoreError>;

    /// Store the file at `path` under `name` unless that name already exists.
    ///
    /// Returns the blob's URI either way.
    async fn upload(&self, path: &Path, name: &str) -> Result<String, StoreError>;

    /// Copy the blob stored under `name` to `destination`.
    async fn download(&self, name: &str, destination: &Path) -> Result<(), StoreError>;
}

/// Hex SHA-256 of a string.
pub fn digest_str(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// Hex SHA-256 of a file's bytes, read in chunks.
pub async fn content_digest(path: &Path) -> Result<String, StoreError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// MIME type guessed from a path or URI suffix.
pub fn content_type_for(path: &str) -> Option<&'static str> {
    let suffix = path.rsplit_once('.')?.1.to_ascii_lowercase();
    let content_type = match suffix.as_str() {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "txt" | "out" | "err" => "text/plain",
        "html" | "htm" => "text/html",
        _ => return None,
    };
    Some(content_type)
}

/// Local path behind a `file://` URI or a bare path.
pub fn path_from_uri(uri: &str) -> Option<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if uri.contains("://") {
        return None;
    }
    Some(PathBuf::from(uri))
}

/// Blob names are flat: a single path segment.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(StoreError::InvalidQuery(format!("invalid blob name {name:?}")));
    }
    Ok(())
}
