//! Candidate meetings as delivered by an event source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{CollaboratorError, EventSource};
use crate::pipeline::HasEntityId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePerson {
    pub full_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub external_person_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVote {
    pub person: SourcePerson,
    pub decision: String,
    #[serde(default)]
    pub external_vote_id: Option<String>,
}

/// A document attached to an agenda item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgendaItem {
    pub name: String,
    #[serde(default)]
    pub matter: Option<String>,
    #[serde(default)]
    pub external_item_id: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub votes: Vec<SourceVote>,
}

/// One meeting: a video plus the metadata scraped alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub body: SourceBody,
    pub event_datetime: DateTime<Utc>,
    pub video_uri: String,
    pub source_uri: String,
    /// Published closed captions (WebVTT), tried before transcribing audio.
    #[serde(default)]
    pub caption_uri: Option<String>,
    #[serde(default)]
    pub agenda_items: Vec<AgendaItem>,
    #[serde(default)]
    pub agenda_file_uri: Option<String>,
    #[serde(default)]
    pub minutes_file_uri: Option<String>,
    #[serde(default)]
    pub external_event_id: Option<String>,
}

impl SourceEvent {
    /// Agenda item names, passed to transcription as phrase hints.
    pub fn phrases(&self) -> Vec<String> {
        self.agenda_items.iter().map(|i| i.name.clone()).collect()
    }
}

impl HasEntityId for SourceEvent {
    fn entity_id(&self) -> String {
        self.video_uri.clone()
    }
}

/// Reads the batch from a JSON array on disk.
pub struct JsonFileEventSource {
    path: PathBuf,
}

impl JsonFileEventSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EventSource for JsonFileEventSource {
    async fn list_events(&self) -> Result<Vec<SourceEvent>, CollaboratorError> {
        let raw = tokio::fs::read(&self.path).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            CollaboratorError::malformed(
                "JsonFileEventSource",
                format!("{}: {e}", self.path.display()),
            )
        })
    }
}

/// Serves a fixed batch.
#[derive(Debug, Clone, Default)]
pub struct StaticEventSource {
    events: Vec<SourceEvent>,
}

impl StaticEventSource {
    pub fn new(events: Vec<SourceEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl EventSource for StaticEventSource {
    async fn list_events(&self) -> Result<Vec<SourceEvent>, CollaboratorError> {
        Ok(self.events.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_file_source_reads_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        tokio::fs::write(
            &path,
            r#"[{
                "body": {"name": "City Council"},
                "event_datetime": "2021-03-01T17:00:00Z",
                "video_uri": "https://video/v1.mp4",
                "source_uri": "https://council/events/1",
                "agenda_items": [
                    {"name": "CB 119981", "attachments": [{"name": "Ordinance", "uri": "https://docs/o.pdf"}]},
                    {"name": "Res 31962", "votes": [{"person": {"full_name": "A. Member"}, "decision": "Approve"}]}
                ]
            }]"#,
        )
        .await
        .unwrap();

        let events = JsonFileEventSource::new(&path).list_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phrases(), vec!["CB 119981", "Res 31962"]);
        assert_eq!(events[0].agenda_items[1].votes[0].decision, "Approve");
        assert_eq!(events[0].entity_id(), "https://video/v1.mp4");
    }

    #[tokio::test]
    async fn malformed_json_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let err = JsonFileEventSource::new(&path).list_events().await.unwrap_err();
        assert_eq!(err.kind(), "CollaboratorError::Malformed");
    }
}
