//! Transcripts built from WebVTT closed captions.
//!
//! Captions are grouped into sentences (a cue ending in `.`, `?` or `!`
//! closes one) and sentences into speaker turns (a sentence opening with the
//! turn marker starts a new turn). Speakers are not identified.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::{CaptionEngine, CollaboratorError, Representation, TranscriptionOutput};
use crate::blob::path_from_uri;

/// `>` as it appears HTML-escaped in broadcast caption feeds.
pub const DEFAULT_TURN_MARKER: &str = "&gt;";

/// Captions are a verbatim record.
const CAPTION_CONFIDENCE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
struct Cue {
    start: f64,
    end: f64,
    text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Sentence {
    start_time: f64,
    end_time: f64,
    text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct SpeakerTurn {
    speaker: String,
    data: Vec<Sentence>,
}

fn malformed(message: impl Into<String>) -> CollaboratorError {
    CollaboratorError::malformed("webvtt", message)
}

/// `hh:mm:ss.ttt` or `mm:ss.ttt`, in seconds.
fn parse_timestamp(raw: &str) -> Result<f64, CollaboratorError> {
    let bad = || malformed(format!("bad timestamp {raw:?}"));
    let (clock, millis) = raw.split_once('.').ok_or_else(bad)?;
    let millis: u32 = millis.parse().map_err(|_| bad())?;
    let parts: Vec<&str> = clock.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(bad());
    }
    let mut seconds = 0u64;
    for part in parts {
        seconds = seconds * 60 + part.parse::<u64>().map_err(|_| bad())?;
    }
    Ok(seconds as f64 + f64::from(millis) / 1000.0)
}

/// Drop inline cue tags such as `<i>` or `<v Chair>`.
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn parse_cues(content: &str) -> Result<Vec<Cue>, CollaboratorError> {
    let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    if !content.starts_with("WEBVTT") {
        return Err(malformed("missing WEBVTT header"));
    }

    let mut cues = Vec::new();
    for block in content.split("\n\n").skip(1) {
        let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
        // Blocks without timing (NOTE, STYLE, REGION) carry no captions.
        let Some(timing) = lines.find(|l| l.contains("-->")) else {
            continue;
        };
        let (start, rest) = timing
            .split_once("-->")
            .ok_or_else(|| malformed(format!("bad timing line {timing:?}")))?;
        let end = rest.split_whitespace().next().unwrap_or_default();

        let text = strip_tags(&lines.collect::<Vec<_>>().join(" "));
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        cues.push(Cue {
            start: parse_timestamp(start.trim())?,
            end: parse_timestamp(end)?,
            text: text.to_string(),
        });
    }

    if cues.is_empty() {
        return Err(malformed("no caption cues"));
    }
    Ok(cues)
}

fn sentences(cues: &[Cue]) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    let mut lines: Vec<&str> = Vec::new();
    let mut start = None;
    for cue in cues {
        let begin = *start.get_or_insert(cue.start);
        lines.push(cue.text.as_str());
        if cue.text.trim_end().ends_with(['.', '?', '!']) {
            sentences.push(Sentence {
                start_time: begin,
                end_time: cue.end,
                text: lines.join(" "),
            });
            lines.clear();
            start = None;
        }
    }
    if let (Some(begin), Some(last)) = (start, cues.last()) {
        sentences.push(Sentence {
            start_time: begin,
            end_time: last.end,
            text: lines.join(" "),
        });
    }
    sentences
}

/// Closed-caption transcription of WebVTT files.
///
/// Writes the raw, timestamped-sentences and timestamped-speaker-turns
/// representations. Caption files are fetched over http(s) or read from
/// `file://` URIs and bare paths.
pub struct WebVttCaptionEngine {
    client: reqwest::Client,
    turn_marker: String,
}

impl WebVttCaptionEngine {
    pub fn new(turn_marker: impl Into<String>) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            turn_marker: turn_marker.into(),
        })
    }

    async fn read_captions(&self, uri: &str) -> Result<String, CollaboratorError> {
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            let path = path_from_uri(uri).ok_or_else(|| {
                CollaboratorError::upstream("webvtt", format!("unsupported uri {uri}"))
            })?;
            return Ok(tokio::fs::read_to_string(&path).await?);
        }

        let response = self.client.get(uri).send().await?;
        if !response.status().is_success() {
            return Err(CollaboratorError::upstream(
                "webvtt",
                format!("GET {uri} returned {}", response.status()),
            ));
        }
        Ok(response.text().await?)
    }

    /// Text after one or more leading turn markers, if the sentence opens a turn.
    fn opens_turn<'a>(&self, text: &'a str) -> Option<&'a str> {
        if self.turn_marker.is_empty() {
            return None;
        }
        let mut rest = text;
        let mut marked = false;
        while let Some(after) = rest.strip_prefix(self.turn_marker.as_str()) {
            rest = after;
            marked = true;
        }
        let rest = rest.trim_start();
        (marked && !rest.is_empty()).then_some(rest)
    }

    fn speaker_turns(&self, sentences: Vec<Sentence>) -> Vec<SpeakerTurn> {
        let mut turns: Vec<SpeakerTurn> = Vec::new();
        for mut sentence in sentences {
            let opened = self.opens_turn(&sentence.text).map(str::to_string);
            let new_turn = opened.is_some();
            if let Some(text) = opened {
                sentence.text = text;
            }
            if !new_turn {
                if let Some(turn) = turns.last_mut() {
                    turn.data.push(sentence);
                    continue;
                }
            }
            turns.push(SpeakerTurn {
                speaker: String::new(),
                data: vec![sentence],
            });
        }
        turns
    }
}

#[async_trait]
impl CaptionEngine for WebVttCaptionEngine {
    async fn transcribe_captions(
        &self,
        caption_uri: &str,
        destinations: &BTreeMap<Representation, PathBuf>,
    ) -> Result<TranscriptionOutput, CollaboratorError> {
        let content = self.read_captions(caption_uri).await?;
        let turns = self.speaker_turns(sentences(&parse_cues(&content)?));

        let sentences: Vec<&Sentence> = turns.iter().flat_map(|t| &t.data).collect();
        let raw = match (sentences.first(), sentences.last()) {
            (Some(first), Some(last)) => vec![Sentence {
                start_time: first.start_time,
                end_time: last.end_time,
                text: sentences
                    .iter()
                    .map(|s| s.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            }],
            _ => Vec::new(),
        };

        let mut produced = Vec::new();
        for (representation, data) in [
            (Representation::Raw, json!(raw)),
            (Representation::TimestampedSentences, json!(sentences)),
            (Representation::TimestampedSpeakerTurns, json!(turns)),
        ] {
            let Some(path) = destinations.get(&representation) else {
                continue;
            };
            let body = json!({
                "format": representation.suffix(),
                "annotations": [],
                "confidence": CAPTION_CONFIDENCE,
                "data": data,
            });
            tokio::fs::write(path, body.to_string()).await?;
            produced.push(representation);
        }

        tracing::debug!(caption_uri = %caption_uri, turns = turns.len(), "Captions transcribed");
        Ok(TranscriptionOutput {
            confidence: Some(CAPTION_CONFIDENCE),
            produced,
        })
    }
}
