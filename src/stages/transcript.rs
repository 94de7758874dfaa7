use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::{scratch_dir, AudioArtifact, AudioStage, TranscribedEvent};
use crate::cache::{transcript_name, StageCache};
use crate::collaborators::{
    confidence_of, CaptionEngine, CollaboratorError, Representation, TranscriptionEngine,
    TranscriptionOutput,
};
use crate::model::{Event, File, Transcript};
use crate::recorder::{ActiveRun, RunValue};
use crate::stage::{Stage, StageError};
use crate::store::UpsertStore;

/// Transcribe the item and keep every representation produced.
///
/// Published captions are tried first when a caption engine is bound; the
/// audio is transcribed only when they are missing or unusable. The richest
/// representation is canonical: speaker turns, then timestamped sentences,
/// then timestamped words, then raw text.
pub struct TranscriptStage {
    cache: StageCache,
    store: UpsertStore,
    engine: Arc<dyn TranscriptionEngine>,
    captions: Option<Arc<dyn CaptionEngine>>,
    audio: Option<AudioStage>,
    scratch: PathBuf,
}

impl TranscriptStage {
    pub fn new(
        cache: StageCache,
        store: UpsertStore,
        engine: Arc<dyn TranscriptionEngine>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            store,
            engine,
            captions: None,
            audio: None,
            scratch: scratch.into(),
        }
    }

    /// Try `captions` before the audio. `audio` extracts the audio of items
    /// whose extraction was deferred, once their captions fail.
    pub fn with_captions(mut self, captions: Arc<dyn CaptionEngine>, audio: AudioStage) -> Self {
        self.captions = Some(captions);
        self.audio = Some(audio);
        self
    }

    /// Caption transcription, or `None` when the audio path should run.
    ///
    /// Caption failures are registered on the run, never returned.
    async fn try_captions(
        &self,
        input: &AudioArtifact,
        destinations: &BTreeMap<Representation, PathBuf>,
        run: &ActiveRun,
    ) -> Result<Option<TranscriptionOutput>, StageError> {
        let (Some(captions), Some(caption_uri)) = (&self.captions, &input.source.caption_uri) else {
            return Ok(None);
        };

        let failure = match captions.transcribe_captions(caption_uri, destinations).await {
            Ok(output) if !output.produced.is_empty() => {
                tracing::info!(
                    key = %input.key,
                    caption_uri = %caption_uri,
                    "Transcribed from captions"
                );
                return Ok(Some(output));
            }
            Ok(_) => "no representation produced".to_string(),
            Err(e) => e.to_string(),
        };

        tracing::warn!(
            key = %input.key,
            caption_uri = %caption_uri,
            error = %failure,
            "Captions unusable, transcribing audio"
        );
        run.register_output(RunValue::typed("caption_fallback", failure))
            .await?;
        for path in destinations.values() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::trace!(error = %e, path = %path.display(), "No partial caption output");
            }
        }
        Ok(None)
    }

    /// Audio URI for the audio path, extracting deferred audio now.
    async fn audio_for(&self, input: &AudioArtifact, run: &ActiveRun) -> Result<String, StageError> {
        if let Some(uri) = &input.audio_uri {
            return Ok(uri.clone());
        }
        let audio = self.audio.as_ref().ok_or_else(|| {
            StageError::permanent(anyhow::anyhow!(
                "audio of {} was deferred but no extraction fallback is bound",
                input.key
            ))
        })?;
        audio.obtain(&input.source, &input.key, run).await
    }

    /// Confidence of a transcript found in the cache.
    ///
    /// Prefers the stored Transcript row; falls back to the artifact's own
    /// `confidence` field.
    async fn recover_confidence(
        &self,
        input: &AudioArtifact,
        uri: &str,
        name: &str,
    ) -> Result<Option<f64>, StageError> {
        let file = self.store.find::<File>(&[("uri", uri.into())]).await?;
        let event = self
            .store
            .find::<Event>(&[("video_uri", input.source.video_uri.as_str().into())])
            .await?;
        if let (Some(file), Some(event)) = (file, event) {
            let transcript = self
                .store
                .find::<Transcript>(&[("event_id", event.id.into()), ("file_id", file.id.into())])
                .await?;
            if let Some(transcript) = transcript {
                return Ok(transcript.data.confidence);
            }
        }

        let scratch = scratch_dir(&self.scratch, &input.key).await?;
        let local = scratch.path().join(name);
        self.cache.fetch(name, &local).await?;
        Ok(confidence_of(&tokio::fs::read(&local).await?))
    }
}

#[async_trait]
impl Stage for TranscriptStage {
    type Input = AudioArtifact;
    type Output = TranscribedEvent;

    fn name(&self) -> &'static str {
        "transcript"
    }

    async fn execute(
        &self,
        input: AudioArtifact,
        run: &ActiveRun,
    ) -> Result<TranscribedEvent, StageError> {
        if let Some(audio_uri) = &input.audio_uri {
            run.register_input(RunValue::Stored(audio_uri.clone()))
                .await?;
        }
        if let Some(caption_uri) = &input.source.caption_uri {
            run.register_input(RunValue::typed("caption_uri", caption_uri.as_str()))
                .await?;
        }

        let candidates: Vec<(Representation, String)> = Representation::richest_first()
            .map(|r| (r, transcript_name(&input.key, r)))
            .collect();
        let names: Vec<String> = candidates.iter().map(|(_, name)| name.clone()).collect();

        if let Some((index, transcript_uri)) = self.cache.probe_first(&names).await? {
            let (representation, name) = &candidates[index];
            let confidence = self.recover_confidence(&input, &transcript_uri, name).await?;
            tracing::info!(
                key = %input.key,
                representation = ?representation,
                "Transcript already produced"
            );
            run.register_output(RunValue::Stored(transcript_uri.clone()))
                .await?;
            return Ok(TranscribedEvent {
                source: input.source,
                key: input.key,
                transcript_uri,
                representation: *representation,
                confidence,
            });
        }

        let scratch = scratch_dir(&self.scratch, &input.key).await?;
        let destinations: BTreeMap<Representation, PathBuf> = candidates
            .iter()
            .map(|(r, name)| (*r, scratch.path().join(name)))
            .collect();

        let output = match self.try_captions(&input, &destinations, run).await? {
            Some(output) => output,
            None => {
                let audio_uri = self.audio_for(&input, run).await?;
                self.engine
                    .transcribe(&audio_uri, &destinations, &input.source.phrases())
                    .await?
            }
        };

        let mut produced = output.produced.clone();
        produced.sort_unstable_by(|a, b| b.cmp(a));
        produced.dedup();
        let canonical = *produced.first().ok_or_else(|| {
            StageError::permanent(CollaboratorError::malformed(
                "transcription",
                "no representation produced",
            ))
        })?;

        // Richest first, so the canonical transcript is cached before the rest.
        let mut transcript_uri = String::new();
        for representation in &produced {
            let path = destinations.get(representation).ok_or_else(|| {
                StageError::permanent(CollaboratorError::malformed(
                    "transcription",
                    format!("unexpected representation {representation:?}"),
                ))
            })?;
            let uri = self
                .cache
                .store(path, &transcript_name(&input.key, *representation))
                .await?;
            run.register_output(RunValue::Stored(uri.clone())).await?;
            if *representation == canonical {
                transcript_uri = uri;
            }
        }

        if let Some(confidence) = output.confidence {
            run.register_output(RunValue::typed("confidence", confidence))
                .await?;
        }
        tracing::info!(
            key = %input.key,
            representation = ?canonical,
            confidence = ?output.confidence,
            "Transcript produced"
        );

        Ok(TranscribedEvent {
            source: input.source,
            key: input.key,
            transcript_uri,
            representation: canonical,
            confidence: output.confidence,
        })
    }
}
