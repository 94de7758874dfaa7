//! The per-item stage chain: audio, transcript, upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::cache::StageCache;
use crate::collaborators::{
    AudioExtractor, CaptionEngine, MediaFetcher, Representation, SourceEvent, TranscriptionEngine,
};
use crate::erased::ItemChain;
use crate::model::{Event, Transcript};
use crate::pipeline::Pipeline;
use crate::recorder::RunRecorder;
use crate::retry::RetryPolicy;
use crate::store::Record;

mod audio;
mod transcript;
mod upload;

pub use audio::AudioStage;
pub use transcript::TranscriptStage;
pub use upload::UploadStage;

/// Output of the audio stage.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub source: SourceEvent,
    /// Stage cache key of the item.
    pub key: String,
    /// `None` while extraction is deferred behind the item's captions.
    pub audio_uri: Option<String>,
}

/// Output of the transcript stage.
#[derive(Debug, Clone)]
pub struct TranscribedEvent {
    pub source: SourceEvent,
    pub key: String,
    /// URI of the canonical (richest) transcript.
    pub transcript_uri: String,
    pub representation: Representation,
    pub confidence: Option<f64>,
}

/// Output of the upload stage.
#[derive(Debug, Clone)]
pub struct IngestedEvent {
    pub event: Record<Event>,
    pub transcript: Record<Transcript>,
}

/// Collaborators the stages call out to.
#[derive(Clone)]
pub struct StageCollaborators {
    pub fetcher: Arc<dyn MediaFetcher>,
    pub extractor: Arc<dyn AudioExtractor>,
    pub transcriber: Arc<dyn TranscriptionEngine>,
    /// Tried before the audio for items with a `caption_uri`.
    pub captions: Option<Arc<dyn CaptionEngine>>,
}

/// Uniquely named per-item scratch directory, removed on drop.
pub(crate) async fn scratch_dir(root: &Path, key: &str) -> std::io::Result<TempDir> {
    tokio::fs::create_dir_all(root).await?;
    tempfile::Builder::new()
        .prefix(&format!("{key}_"))
        .tempdir_in(root)
}

/// Assemble the audio -> transcript -> upload chain.
pub fn ingestion_pipeline(
    name: &str,
    recorder: RunRecorder,
    cache: StageCache,
    collaborators: StageCollaborators,
    scratch: impl Into<PathBuf>,
    retry: RetryPolicy,
) -> Arc<dyn ItemChain> {
    let scratch = scratch.into();
    let store = recorder.store().clone();
    let audio = AudioStage::new(
        cache.clone(),
        collaborators.fetcher,
        collaborators.extractor,
        scratch.clone(),
    )
    .defer_captioned(collaborators.captions.is_some());
    let mut transcript = TranscriptStage::new(
        cache,
        store.clone(),
        collaborators.transcriber,
        scratch,
    );
    if let Some(captions) = collaborators.captions {
        transcript = transcript.with_captions(captions, audio.clone());
    }

    let pipeline = Pipeline::new(name, recorder)
        .start_with(audio)
        .then(transcript)
        .then(UploadStage::new(store))
        .with_retry(retry)
        .build();
    Arc::new(pipeline)
}
