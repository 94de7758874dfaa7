use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{CollaboratorError, MediaFetcher};
use crate::blob::path_from_uri;

/// Downloads http(s) media; copies `file://` URIs and bare paths.
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new() -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(3600))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, uri: &str, destination: &Path) -> Result<PathBuf, CollaboratorError> {
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            let source = path_from_uri(uri).ok_or_else(|| {
                CollaboratorError::upstream("HttpMediaFetcher", format!("unsupported uri {uri}"))
            })?;
            tokio::fs::copy(&source, destination).await?;
            return Ok(destination.to_path_buf());
        }

        tracing::debug!(uri = %uri, "Downloading media");
        let mut response = self.client.get(uri).send().await?;
        if !response.status().is_success() {
            return Err(CollaboratorError::upstream(
                "HttpMediaFetcher",
                format!("GET {uri} returned {}", response.status()),
            ));
        }

        let expected = response.content_length();
        let mut file = tokio::fs::File::create(destination).await?;
        let mut downloaded = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = expected {
            if downloaded != expected {
                return Err(CollaboratorError::upstream(
                    "HttpMediaFetcher",
                    format!("incomplete download of {uri}: {downloaded} of {expected} bytes"),
                ));
            }
        }

        Ok(destination.to_path_buf())
    }
}
