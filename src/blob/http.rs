//! Read-only blob store served over HTTP.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{validate_name, BlobStore};
use crate::store::StoreError;

/// Blob store that can only probe and fetch public objects.
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, name: &str) -> Result<String, StoreError> {
        validate_name(name)?;
        Ok(format!("{}/{}", self.base_url, name))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    fn describe(&self) -> String {
        format!("http {} (read-only)", self.base_url)
    }

    fn is_writable(&self) -> bool {
        false
    }

    async fn locate(&self, name: &str) -> Result<Option<String>, StoreError> {
        let url = self.url_for(name)?;
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(Some(url)),
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::FORBIDDEN => Ok(None),
            status => Err(StoreError::Backend(format!("HEAD {url} returned {status}"))),
        }
    }

    async fn upload(&self, _path: &Path, name: &str) -> Result<String, StoreError> {
        match self.locate(name).await? {
            Some(uri) => Ok(uri),
            None => Err(StoreError::missing_credentials(format!("upload {name}"))),
        }
    }

    async fn download(&self, name: &str, destination: &Path) -> Result<(), StoreError> {
        let url = self.url_for(name)?;
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(destination).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Answers every request with `status` and an empty body.
    async fn serve(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buffer = [0u8; 4096];
                    let _ = socket.read(&mut buffer).await;
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/blobs")
    }

    #[tokio::test]
    async fn upload_to_an_existing_name_returns_its_uri() {
        let base = serve("200 OK").await;
        let store = HttpBlobStore::new(&base).unwrap();
        let uri = store
            .upload(Path::new("/nonexistent/audio.wav"), "k_audio.wav")
            .await
            .unwrap();
        assert_eq!(uri, format!("{base}/k_audio.wav"));
    }

    #[tokio::test]
    async fn upload_of_a_new_name_needs_credentials() {
        let store = HttpBlobStore::new(serve("404 Not Found").await).unwrap();
        let err = store
            .upload(Path::new("/nonexistent/audio.wav"), "k_audio.wav")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingCredentials { .. }));
    }
}
