use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use super::{scratch_dir, AudioArtifact};
use crate::cache::{audio_name, item_key, StageCache};
use crate::collaborators::{AudioExtractor, MediaFetcher, SourceEvent};
use crate::recorder::{ActiveRun, RunValue};
use crate::stage::{Stage, StageError};

/// Fetch the video, extract mono 16 kHz PCM audio, store it.
///
/// Skipped entirely when the item's audio is already in the blob store.
/// With caption deferral on, a captioned item's extraction waits for the
/// transcript stage to try its captions first.
#[derive(Clone)]
pub struct AudioStage {
    cache: StageCache,
    fetcher: Arc<dyn MediaFetcher>,
    extractor: Arc<dyn AudioExtractor>,
    scratch: PathBuf,
    defer_captioned: bool,
}

impl AudioStage {
    pub fn new(
        cache: StageCache,
        fetcher: Arc<dyn MediaFetcher>,
        extractor: Arc<dyn AudioExtractor>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            extractor,
            scratch: scratch.into(),
            defer_captioned: false,
        }
    }

    /// Leave extraction of items carrying a `caption_uri` to the transcript
    /// stage's fallback.
    pub fn defer_captioned(mut self, defer: bool) -> Self {
        self.defer_captioned = defer;
        self
    }

    /// URI of the item's audio, extracting it on a cache miss.
    ///
    /// Sidecar logs and the stored audio are registered on `run`.
    pub(super) async fn obtain(
        &self,
        source: &SourceEvent,
        key: &str,
        run: &ActiveRun,
    ) -> Result<String, StageError> {
        let name = audio_name(key);
        if let Some(audio_uri) = self.cache.probe(&name).await? {
            tracing::info!(key = %key, video_uri = %source.video_uri, "Audio already extracted");
            run.register_output(RunValue::Stored(audio_uri.clone())).await?;
            return Ok(audio_uri);
        }

        // Removed with everything in it when this scope exits.
        let scratch = scratch_dir(&self.scratch, key).await?;

        let video = self
            .fetcher
            .fetch(&source.video_uri, &scratch.path().join(format!("{key}_video")))
            .await?;
        let extracted = self
            .extractor
            .extract(&video, &scratch.path().join(&name))
            .await?;
        if let Err(e) = tokio::fs::remove_file(&video).await {
            tracing::debug!(error = %e, "Scratch video already gone");
        }

        run.register_output(RunValue::Artifact(extracted.stdout_log))
            .await?;
        run.register_output(RunValue::Artifact(extracted.stderr_log))
            .await?;

        let audio_uri = self.cache.store(&extracted.audio, &name).await?;
        run.register_output(RunValue::Stored(audio_uri.clone())).await?;
        tracing::info!(key = %key, audio_uri = %audio_uri, "Audio extracted");
        Ok(audio_uri)
    }
}

#[async_trait]
impl Stage for AudioStage {
    type Input = SourceEvent;
    type Output = AudioArtifact;

    fn name(&self) -> &'static str {
        "audio"
    }

    async fn execute(&self, input: SourceEvent, run: &ActiveRun) -> Result<AudioArtifact, StageError> {
        let key = item_key(&input.video_uri);
        run.register_input(input.video_uri.as_str()).await?;

        let audio_uri = if self.defer_captioned && input.caption_uri.is_some() {
            let cached = self.cache.probe(&audio_name(&key)).await?;
            match &cached {
                Some(uri) => run.register_output(RunValue::Stored(uri.clone())).await?,
                None => {
                    tracing::info!(key = %key, "Audio deferred until captions are tried");
                    run.register_output(RunValue::typed("deferred", true)).await?;
                }
            }
            cached
        } else {
            Some(self.obtain(&input, &key, run).await?)
        };

        Ok(AudioArtifact {
            source: input,
            key,
            audio_uri,
        })
    }
}
