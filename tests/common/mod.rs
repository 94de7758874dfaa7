//! Shared fakes and fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use councilflow::collaborators::{
    AgendaItem, Attachment, ExtractedAudio, SourceBody, SourcePerson, SourceVote,
    StaticEventSource, TranscriptionOutput,
};
use councilflow::model::{Algorithm, Run, RunInput, RunOutput, RunOutputFile};
use councilflow::{
    AudioExtractor, BlobStore, CaptionEngine, CollaboratorError, LocalBlobStore, MediaFetcher,
    MemoryDocumentStore, OrchestratorBuilder, PipelineOrchestrator, Query, Record, Representation,
    RetryPolicy, RunRecorder, SourceEvent, StageCollaborators, TranscriptionEngine, UpsertStore,
};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Fetcher that writes a small fake video, counting calls.
#[derive(Default)]
pub struct FakeFetcher {
    pub calls: AtomicUsize,
    /// Videos that fail permanently.
    pub broken: Mutex<HashSet<String>>,
    /// Number of calls left that fail with a transient I/O error.
    pub transient_failures: AtomicUsize,
}

impl FakeFetcher {
    pub fn break_video(&self, video_uri: &str) {
        self.broken.lock().unwrap().insert(video_uri.to_string());
    }

    pub fn fail_next(&self, times: usize) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, uri: &str, destination: &Path) -> Result<PathBuf, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.lock().unwrap().contains(uri) {
            return Err(CollaboratorError::upstream("fake-fetcher", format!("404 for {uri}")));
        }
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into());
        }
        tokio::fs::write(destination, format!("video:{uri}")).await?;
        Ok(destination.to_path_buf())
    }
}

/// Extractor that derives the audio from the video bytes.
#[derive(Default)]
pub struct FakeExtractor {
    pub calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioExtractor for FakeExtractor {
    async fn extract(
        &self,
        video: &Path,
        destination: &Path,
    ) -> Result<ExtractedAudio, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let video_bytes = tokio::fs::read(video).await?;
        let mut audio = b"pcm:".to_vec();
        audio.extend_from_slice(&video_bytes);
        tokio::fs::write(destination, &audio).await?;

        let stdout_log = PathBuf::from(format!("{}.out", destination.display()));
        let stderr_log = PathBuf::from(format!("{}.err", destination.display()));
        tokio::fs::write(&stdout_log, b"").await?;
        tokio::fs::write(&stderr_log, format!("extracted {} bytes\n", audio.len())).await?;

        Ok(ExtractedAudio {
            audio: destination.to_path_buf(),
            stdout_log,
            stderr_log,
        })
    }
}

/// What a speech-to-text engine can render; speaker turns come from captions.
pub const SPEECH_REPRESENTATIONS: [Representation; 3] = [
    Representation::Raw,
    Representation::TimestampedWords,
    Representation::TimestampedSentences,
];

/// Transcriber that writes JSON for a configurable set of representations.
pub struct FakeTranscriber {
    pub calls: AtomicUsize,
    pub produces: Mutex<Vec<Representation>>,
    pub confidence: Option<f64>,
    pub phrases_seen: Mutex<Vec<Vec<String>>>,
}

impl Default for FakeTranscriber {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            produces: Mutex::new(SPEECH_REPRESENTATIONS.to_vec()),
            confidence: Some(0.93),
            phrases_seen: Mutex::new(Vec::new()),
        }
    }
}

impl FakeTranscriber {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn produce_only(&self, representations: &[Representation]) {
        *self.produces.lock().unwrap() = representations.to_vec();
    }
}

#[async_trait]
impl TranscriptionEngine for FakeTranscriber {
    async fn transcribe(
        &self,
        audio_uri: &str,
        destinations: &BTreeMap<Representation, PathBuf>,
        phrases: &[String],
    ) -> Result<TranscriptionOutput, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.phrases_seen.lock().unwrap().push(phrases.to_vec());

        let produces = self.produces.lock().unwrap().clone();
        let mut produced = Vec::new();
        for representation in produces {
            let Some(path) = destinations.get(&representation) else {
                continue;
            };
            let body = serde_json::json!({
                "audio": audio_uri,
                "format": representation.suffix(),
                "confidence": self.confidence,
                "text": "the meeting is called to order",
            });
            tokio::fs::write(path, body.to_string()).await?;
            produced.push(representation);
        }

        Ok(TranscriptionOutput {
            confidence: self.confidence,
            produced,
        })
    }
}

/// Caption engine that renders raw, sentences and speaker turns, or fails
/// like an unreachable caption host.
#[derive(Default)]
pub struct FakeCaptions {
    pub calls: AtomicUsize,
    pub unavailable: AtomicBool,
}

impl FakeCaptions {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn make_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptionEngine for FakeCaptions {
    async fn transcribe_captions(
        &self,
        caption_uri: &str,
        destinations: &BTreeMap<Representation, PathBuf>,
    ) -> Result<TranscriptionOutput, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::upstream(
                "fake-captions",
                format!("GET {caption_uri} returned 404 Not Found"),
            ));
        }

        let mut produced = Vec::new();
        for representation in [
            Representation::Raw,
            Representation::TimestampedSentences,
            Representation::TimestampedSpeakerTurns,
        ] {
            let Some(path) = destinations.get(&representation) else {
                continue;
            };
            let body = serde_json::json!({
                "captions": caption_uri,
                "format": representation.suffix(),
                "confidence": 1.0,
                "data": [],
            });
            tokio::fs::write(path, body.to_string()).await?;
            produced.push(representation);
        }

        Ok(TranscriptionOutput {
            confidence: Some(1.0),
            produced,
        })
    }
}

/// Memory document store plus a local blob store in a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub documents: MemoryDocumentStore,
    pub store: UpsertStore,
    pub blobs: Arc<LocalBlobStore>,
    pub fetcher: Arc<FakeFetcher>,
    pub extractor: Arc<FakeExtractor>,
    pub transcriber: Arc<FakeTranscriber>,
    pub captions: Arc<FakeCaptions>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let documents = MemoryDocumentStore::new();
        let store = UpsertStore::new(Arc::new(documents.clone()));
        let blobs = Arc::new(LocalBlobStore::new(dir.path().join("blobs")));
        Self {
            dir,
            documents,
            store,
            blobs,
            fetcher: Arc::new(FakeFetcher::default()),
            extractor: Arc::new(FakeExtractor::default()),
            transcriber: Arc::new(FakeTranscriber::default()),
            captions: Arc::new(FakeCaptions::default()),
        }
    }

    pub fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    pub fn blob_store(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    pub fn recorder(&self) -> RunRecorder {
        RunRecorder::new(self.store.clone(), self.blob_store(), self.scratch())
    }

    pub fn collaborators(&self) -> StageCollaborators {
        StageCollaborators {
            fetcher: self.fetcher.clone(),
            extractor: self.extractor.clone(),
            transcriber: self.transcriber.clone(),
            captions: None,
        }
    }

    pub fn collaborators_with_captions(&self) -> StageCollaborators {
        StageCollaborators {
            captions: Some(self.captions.clone()),
            ..self.collaborators()
        }
    }

    pub fn orchestrator(&self, events: Vec<SourceEvent>) -> OrchestratorBuilder {
        self.orchestrator_with(events, self.collaborators())
    }

    pub fn orchestrator_with(
        &self,
        events: Vec<SourceEvent>,
        collaborators: StageCollaborators,
    ) -> OrchestratorBuilder {
        PipelineOrchestrator::builder(
            self.store.clone(),
            self.blob_store(),
            Arc::new(StaticEventSource::new(events)),
            collaborators,
        )
        .workers(4)
        .scratch_dir(self.scratch())
        .retry(RetryPolicy::None)
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.documents.count(collection).await
    }

    /// Every run recorded under an algorithm name.
    pub async fn runs_of(&self, algorithm: &str) -> Vec<Record<Run>> {
        let algorithms: Vec<Record<Algorithm>> = self
            .store
            .select(Query::collection("algorithm").where_eq("name", algorithm))
            .await
            .unwrap();
        let mut runs = Vec::new();
        for algorithm in algorithms {
            let mut found: Vec<Record<Run>> = self
                .store
                .select(Query::collection("run").where_eq("algorithm_id", algorithm.id.as_str()))
                .await
                .unwrap();
            runs.append(&mut found);
        }
        runs
    }

    pub async fn inputs_of(&self, run_id: &str) -> Vec<Record<RunInput>> {
        self.store
            .select(Query::collection("run_input").where_eq("run_id", run_id))
            .await
            .unwrap()
    }

    pub async fn outputs_of(&self, run_id: &str) -> Vec<Record<RunOutput>> {
        self.store
            .select(Query::collection("run_output").where_eq("run_id", run_id))
            .await
            .unwrap()
    }

    pub async fn output_files_of(&self, run_id: &str) -> Vec<Record<RunOutputFile>> {
        self.store
            .select(Query::collection("run_output_file").where_eq("run_id", run_id))
            .await
            .unwrap()
    }
}

/// A meeting with two agenda items, one attachment and one vote.
pub fn council_meeting(video_uri: &str) -> SourceEvent {
    let councillor = SourcePerson {
        full_name: "Dana Ortiz".to_string(),
        email: Some("dana.ortiz@example.gov".to_string()),
        phone: None,
        website: None,
        external_person_id: Some("p-17".to_string()),
    };
    SourceEvent {
        body: SourceBody {
            name: "City Council".to_string(),
            description: Some("Full council".to_string()),
        },
        event_datetime: Utc.with_ymd_and_hms(2024, 3, 4, 18, 0, 0).unwrap(),
        video_uri: video_uri.to_string(),
        source_uri: format!("https://council.example.gov/meetings?video={video_uri}"),
        caption_uri: None,
        agenda_items: vec![
            AgendaItem {
                name: "Call to order".to_string(),
                matter: None,
                external_item_id: Some("ai-1".to_string()),
                decision: None,
                attachments: Vec::new(),
                votes: Vec::new(),
            },
            AgendaItem {
                name: "CB 119911 Street tree ordinance".to_string(),
                matter: Some("CB 119911".to_string()),
                external_item_id: Some("ai-2".to_string()),
                decision: Some("Passed".to_string()),
                attachments: vec![Attachment {
                    name: "Ordinance text".to_string(),
                    uri: "https://council.example.gov/docs/cb119911.pdf".to_string(),
                }],
                votes: vec![SourceVote {
                    person: councillor,
                    decision: "Approve".to_string(),
                    external_vote_id: Some("v-1".to_string()),
                }],
            },
        ],
        agenda_file_uri: None,
        minutes_file_uri: None,
        external_event_id: Some("e-2024-03-04".to_string()),
    }
}

/// The same meeting with published closed captions.
pub fn captioned_meeting(video_uri: &str) -> SourceEvent {
    SourceEvent {
        caption_uri: Some(format!("{video_uri}.vtt")),
        ..council_meeting(video_uri)
    }
}
