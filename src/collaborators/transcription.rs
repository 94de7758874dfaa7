use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;

use super::{CollaboratorError, Representation, TranscriptionEngine, TranscriptionOutput};
use crate::blob::path_from_uri;

/// Transcription through an external program.
///
/// Each argument may reference `{audio}`, `{phrases}` (comma separated) and
/// one placeholder per representation (`{raw}`, `{ts_words}`,
/// `{ts_sentences}`, `{ts_speaker_turns}`). A representation counts as produced when its file
/// exists after the program exits. Confidence is read from a JSON object on
/// stdout, falling back to the richest produced file.
#[derive(Debug, Clone)]
pub struct CommandTranscriptionEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTranscriptionEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render(
        &self,
        audio: &str,
        destinations: &BTreeMap<Representation, PathBuf>,
        phrases: &[String],
    ) -> Vec<String> {
        let joined = phrases.join(",");
        self.args
            .iter()
            .map(|arg| {
                let mut rendered = arg.replace("{audio}", audio).replace("{phrases}", &joined);
                for (representation, path) in destinations {
                    let placeholder = format!("{{{}}}", representation.suffix());
                    rendered = rendered.replace(&placeholder, &path.display().to_string());
                }
                rendered
            })
            .collect()
    }
}

/// Confidence field of a JSON payload, if present.
pub(crate) fn confidence_of(raw: &[u8]) -> Option<f64> {
    serde_json::from_slice::<Value>(raw)
        .ok()?
        .get("confidence")?
        .as_f64()
}

#[async_trait]
impl TranscriptionEngine for CommandTranscriptionEngine {
    async fn transcribe(
        &self,
        audio_uri: &str,
        destinations: &BTreeMap<Representation, PathBuf>,
        phrases: &[String],
    ) -> Result<TranscriptionOutput, CollaboratorError> {
        let audio = path_from_uri(audio_uri)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| audio_uri.to_string());

        let output = Command::new(&self.program)
            .args(self.render(&audio, destinations, phrases))
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(CollaboratorError::upstream(
                "transcription",
                format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let mut produced = Vec::new();
        for (representation, path) in destinations {
            if tokio::fs::try_exists(path).await? {
                produced.push(*representation);
            }
        }

        let mut confidence = confidence_of(&output.stdout);
        if confidence.is_none() {
            if let Some(path) = produced.iter().max().and_then(|r| destinations.get(r)) {
                confidence = confidence_of(&tokio::fs::read(path).await?);
            }
        }

        Ok(TranscriptionOutput {
            confidence,
            produced,
        })
    }
}
