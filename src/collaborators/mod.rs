//! External collaborators the stages call into.
//!
//! Each seam is a narrow async trait. Concrete implementations here shell
//! out or talk HTTP; tests substitute counting fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod captions;
mod ffmpeg;
mod media;
mod source;
mod transcription;

pub use captions::{WebVttCaptionEngine, DEFAULT_TURN_MARKER};
pub use ffmpeg::FfmpegAudioExtractor;
pub use media::HttpMediaFetcher;
pub use source::{
    AgendaItem, Attachment, JsonFileEventSource, SourceBody, SourceEvent, SourcePerson,
    SourceVote, StaticEventSource,
};
pub use transcription::CommandTranscriptionEngine;
pub(crate) use transcription::confidence_of;

/// Error raised by an external collaborator.
#[derive(Error, Debug)]
pub enum CollaboratorError {
    /// The collaborator ran but reported failure.
    #[error("{collaborator} failed: {message}")]
    Upstream {
        collaborator: &'static str,
        message: String,
    },

    /// The collaborator returned something that could not be parsed.
    #[error("{collaborator} returned a malformed payload: {message}")]
    Malformed {
        collaborator: &'static str,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CollaboratorError {
    pub fn upstream(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Upstream {
            collaborator,
            message: message.into(),
        }
    }

    pub fn malformed(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            collaborator,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upstream { .. } => "CollaboratorError::Upstream",
            Self::Malformed { .. } => "CollaboratorError::Malformed",
            Self::Io(_) => "CollaboratorError::Io",
            Self::Http(_) => "CollaboratorError::Http",
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upstream { .. } | Self::Malformed { .. } => false,
            Self::Io(_) => true,
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
        }
    }
}

/// Variants a transcription can be rendered in, ordered by richness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    Raw,
    TimestampedWords,
    TimestampedSentences,
    /// Sentences grouped by speaker turn; only caption engines produce these.
    TimestampedSpeakerTurns,
}

impl Representation {
    pub const ALL: [Representation; 4] = [
        Representation::Raw,
        Representation::TimestampedWords,
        Representation::TimestampedSentences,
        Representation::TimestampedSpeakerTurns,
    ];

    /// Probe order when choosing the canonical transcript.
    pub fn richest_first() -> impl Iterator<Item = Representation> {
        Self::ALL.into_iter().rev()
    }

    /// Artifact name fragment.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::TimestampedWords => "ts_words",
            Self::TimestampedSentences => "ts_sentences",
            Self::TimestampedSpeakerTurns => "ts_speaker_turns",
        }
    }
}

/// Supplies the batch of candidate meetings.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn list_events(&self) -> Result<Vec<SourceEvent>, CollaboratorError>;
}

/// Fetches a remote media file into scratch space.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetch `uri` to `destination`, returning the written path.
    async fn fetch(&self, uri: &str, destination: &Path) -> Result<PathBuf, CollaboratorError>;
}

/// Audio written by an extractor plus its diagnostic sidecars.
#[derive(Debug, Clone)]
pub struct ExtractedAudio {
    pub audio: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

/// Extracts single-channel 16 kHz PCM audio from a video.
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    async fn extract(
        &self,
        video: &Path,
        destination: &Path,
    ) -> Result<ExtractedAudio, CollaboratorError>;
}

/// Result of a transcription.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionOutput {
    pub confidence: Option<f64>,
    /// Representations actually written to their destination paths.
    pub produced: Vec<Representation>,
}

/// Speech-to-text engine.
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Transcribe the audio at `audio_uri`, writing each representation the
    /// engine supports to its destination path. `phrases` are domain terms
    /// (agenda item names) the engine may use as recognition hints.
    async fn transcribe(
        &self,
        audio_uri: &str,
        destinations: &BTreeMap<Representation, PathBuf>,
        phrases: &[String],
    ) -> Result<TranscriptionOutput, CollaboratorError>;
}

/// Builds transcripts from a meeting's published closed captions.
#[async_trait]
pub trait CaptionEngine: Send + Sync {
    /// Read the captions at `caption_uri`, writing each representation the
    /// engine supports to its destination path.
    async fn transcribe_captions(
        &self,
        caption_uri: &str,
        destinations: &BTreeMap<Representation, PathBuf>,
    ) -> Result<TranscriptionOutput, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representations_rank_by_richness() {
        let order: Vec<_> = Representation::richest_first().collect();
        assert_eq!(
            order,
            vec![
                Representation::TimestampedSpeakerTurns,
                Representation::TimestampedSentences,
                Representation::TimestampedWords,
                Representation::Raw,
            ]
        );
        assert_eq!(
            [Representation::Raw, Representation::TimestampedSentences]
                .into_iter()
                .max(),
            Some(Representation::TimestampedSentences)
        );
    }

    #[test]
    fn upstream_failures_are_not_transient() {
        assert!(!CollaboratorError::upstream("ffmpeg", "exit 1").is_transient());
        let io = CollaboratorError::from(std::io::Error::other("reset"));
        assert!(io.is_transient());
        assert_eq!(io.kind(), "CollaboratorError::Io");
    }
}
