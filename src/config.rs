//! TOML configuration and the collaborator registry.
//!
//! Every collaborator table carries a `kind` tag; the tag selects a
//! constructor at compile time and `build()` returns the interface-typed
//! handle.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::blob::{BlobStore, HttpBlobStore, LocalBlobStore};
use crate::collaborators::{
    AudioExtractor, CaptionEngine, CommandTranscriptionEngine, EventSource, FfmpegAudioExtractor,
    HttpMediaFetcher, JsonFileEventSource, MediaFetcher, TranscriptionEngine,
    WebVttCaptionEngine, DEFAULT_TURN_MARKER,
};
use crate::orchestrator::PipelineOrchestrator;
use crate::retry::RetryPolicy;
use crate::stages::StageCollaborators;
use crate::store::{DocumentStore, MemoryDocumentStore, RestDocumentStore, UpsertStore};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to build {component}: {message}")]
    Build {
        component: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn build(component: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Build {
            component,
            message: err.to_string(),
        }
    }
}

fn default_pipeline_name() -> String {
    "event_gather".to_string()
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_turn_marker() -> String {
    DEFAULT_TURN_MARKER.to_string()
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_pipeline_name")]
    pub pipeline_name: String,
    /// Worker pool size; defaults to four per available core.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Root for scratch files; defaults to the OS temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub document_store: DocumentStoreConfig,
    pub blob_store: BlobStoreConfig,
    pub event_source: EventSourceConfig,
    #[serde(default)]
    pub media_fetcher: MediaFetcherConfig,
    #[serde(default)]
    pub audio_extractor: AudioExtractorConfig,
    pub transcription: TranscriptionConfig,
    /// Without it every item is transcribed from its audio.
    #[serde(default)]
    pub captions: Option<CaptionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryConfig {
    #[default]
    None,
    Fixed {
        retries: u32,
        delay_ms: u64,
    },
    Exponential {
        retries: u32,
        #[serde(default)]
        initial_delay_ms: Option<u64>,
        #[serde(default)]
        max_delay_ms: Option<u64>,
    },
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        match config {
            RetryConfig::None => RetryPolicy::None,
            RetryConfig::Fixed { retries, delay_ms } => {
                RetryPolicy::fixed(*retries, Duration::from_millis(*delay_ms))
            }
            RetryConfig::Exponential {
                retries,
                initial_delay_ms,
                max_delay_ms,
            } => RetryPolicy::exponential(*retries).with_backoff(
                initial_delay_ms.map(Duration::from_millis),
                max_delay_ms.map(Duration::from_millis),
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentStoreConfig {
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite { url: String },
    /// Read-only, unauthenticated, rate-limited.
    Rest {
        base_url: String,
        #[serde(default = "default_requests_per_second")]
        requests_per_second: u32,
    },
}

impl DocumentStoreConfig {
    pub async fn build(&self) -> Result<Arc<dyn DocumentStore>, ConfigError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryDocumentStore::new())),
            #[cfg(feature = "sqlite")]
            Self::Sqlite { url } => {
                use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
                use std::str::FromStr;

                let options = SqliteConnectOptions::from_str(url)
                    .map_err(|e| ConfigError::build("document_store", e))?
                    .create_if_missing(true);
                // Each connection to an in-memory database sees its own database.
                let max_connections = if url.contains(":memory:") { 1 } else { 5 };
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await
                    .map_err(|e| ConfigError::build("document_store", e))?;

                let store = crate::store::SqliteDocumentStore::new(pool);
                store
                    .run_migrations()
                    .await
                    .map_err(|e| ConfigError::build("document_store", e))?;
                Ok(Arc::new(store))
            }
            Self::Rest {
                base_url,
                requests_per_second,
            } => {
                let store = RestDocumentStore::new(base_url.clone(), *requests_per_second)
                    .map_err(|e| ConfigError::build("document_store", e))?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobStoreConfig {
    Local {
        root: PathBuf,
        #[serde(default)]
        read_only: bool,
    },
    /// Read-only.
    Http { base_url: String },
}

impl BlobStoreConfig {
    pub fn build(&self) -> Result<Arc<dyn BlobStore>, ConfigError> {
        match self {
            Self::Local { root, read_only } => Ok(if *read_only {
                Arc::new(LocalBlobStore::read_only(root))
            } else {
                Arc::new(LocalBlobStore::new(root))
            }),
            Self::Http { base_url } => Ok(Arc::new(
                HttpBlobStore::new(base_url.clone())
                    .map_err(|e| ConfigError::build("blob_store", e))?,
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSourceConfig {
    JsonFile { path: PathBuf },
}

impl EventSourceConfig {
    pub fn build(&self) -> Result<Arc<dyn EventSource>, ConfigError> {
        match self {
            Self::JsonFile { path } => Ok(Arc::new(JsonFileEventSource::new(path))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaFetcherConfig {
    #[default]
    Http,
}

impl MediaFetcherConfig {
    pub fn build(&self) -> Result<Arc<dyn MediaFetcher>, ConfigError> {
        match self {
            Self::Http => Ok(Arc::new(
                HttpMediaFetcher::new().map_err(|e| ConfigError::build("media_fetcher", e))?,
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioExtractorConfig {
    Ffmpeg {
        #[serde(default = "default_ffmpeg")]
        binary: PathBuf,
    },
}

impl Default for AudioExtractorConfig {
    fn default() -> Self {
        Self::Ffmpeg {
            binary: default_ffmpeg(),
        }
    }
}

impl AudioExtractorConfig {
    pub fn build(&self) -> Result<Arc<dyn AudioExtractor>, ConfigError> {
        match self {
            Self::Ffmpeg { binary } => Ok(Arc::new(FfmpegAudioExtractor::new(binary))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptionConfig {
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl TranscriptionConfig {
    pub fn build(&self) -> Result<Arc<dyn TranscriptionEngine>, ConfigError> {
        match self {
            Self::Command { program, args } => Ok(Arc::new(CommandTranscriptionEngine::new(
                program,
                args.clone(),
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptionConfig {
    Webvtt {
        #[serde(default = "default_turn_marker")]
        turn_marker: String,
    },
}

impl CaptionConfig {
    pub fn build(&self) -> Result<Arc<dyn CaptionEngine>, ConfigError> {
        match self {
            Self::Webvtt { turn_marker } => Ok(Arc::new(
                WebVttCaptionEngine::new(turn_marker.clone())
                    .map_err(|e| ConfigError::build("captions", e))?,
            )),
        }
    }
}

impl Config {
    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.pipeline_name.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline_name must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve every collaborator and assemble the orchestrator.
    pub async fn build(&self) -> Result<PipelineOrchestrator, ConfigError> {
        let store = UpsertStore::new(self.document_store.build().await?);
        let blobs = self.blob_store.build()?;
        let source = self.event_source.build()?;
        let collaborators = StageCollaborators {
            fetcher: self.media_fetcher.build()?,
            extractor: self.audio_extractor.build()?,
            transcriber: self.transcription.build()?,
            captions: self.captions.as_ref().map(CaptionConfig::build).transpose()?,
        };

        tracing::info!(
            document_store = %store.backend().describe(),
            blob_store = %blobs.describe(),
            "Collaborators resolved"
        );

        let mut builder = PipelineOrchestrator::builder(store, blobs, source, collaborators)
            .name(self.pipeline_name.clone())
            .retry(RetryPolicy::from(&self.retry));
        if let Some(workers) = self.workers {
            builder = builder.workers(workers);
        }
        if let Some(scratch) = &self.scratch_dir {
            builder = builder.scratch_dir(scratch);
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        pipeline_name = "seattle"
        workers = 3

        [retry]
        policy = "fixed"
        retries = 2
        delay_ms = 10

        [document_store]
        kind = "memory"

        [blob_store]
        kind = "local"
        root = "/tmp/councilflow-blobs"

        [event_source]
        kind = "json_file"
        path = "events.json"

        [transcription]
        kind = "command"
        program = "transcribe"
        args = ["{audio}", "{ts_sentences}"]
    "#;

    #[test]
    fn parses_tagged_tables() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.pipeline_name, "seattle");
        assert_eq!(config.workers, Some(3));
        assert!(matches!(config.document_store, DocumentStoreConfig::Memory));
        assert!(matches!(
            config.blob_store,
            BlobStoreConfig::Local { read_only: false, .. }
        ));
        assert!(matches!(config.media_fetcher, MediaFetcherConfig::Http));
        assert!(matches!(
            &config.audio_extractor,
            AudioExtractorConfig::Ffmpeg { binary } if binary == Path::new("ffmpeg")
        ));

        let policy = RetryPolicy::from(&config.retry);
        assert_eq!(policy.attempt_budget(), 3);
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(10)));
    }

    #[test]
    fn captions_are_optional() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert!(config.captions.is_none());

        let with_captions = format!("{MINIMAL}\n[captions]\nkind = \"webvtt\"\n");
        let config = Config::from_toml(&with_captions).unwrap();
        assert!(matches!(
            &config.captions,
            Some(CaptionConfig::Webvtt { turn_marker }) if turn_marker == "&gt;"
        ));
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let broken = MINIMAL.replace("kind = \"memory\"", "kind = \"mongo\"");
        assert!(matches!(
            Config::from_toml(&broken),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn zero_workers_rejected() {
        let broken = MINIMAL.replace("workers = 3", "workers = 0");
        assert!(matches!(
            Config::from_toml(&broken),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn builds_orchestrator_from_registry() {
        let orchestrator = Config::from_toml(MINIMAL).unwrap().build().await.unwrap();
        assert_eq!(orchestrator.name(), "seattle");
        assert_eq!(orchestrator.workers(), 3);
    }
}
