//! Entity schema.
//!
//! Every entity is immutable once created; the only write path is
//! [`UpsertStore::get_or_upload`](crate::store::UpsertStore::get_or_upload).

use chrono::{DateTime, Utc};

use crate::store::{Entity, FieldReader, FieldValue, Fields, StoreError};

fn fields<const N: usize>(pairs: [(&str, FieldValue); N]) -> Fields {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// A deliberative body (council, committee).
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub name: String,
    pub description: Option<String>,
}

impl Entity for Body {
    const COLLECTION: &'static str = "body";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![("name", self.name.clone().into())]
    }

    fn payload(&self) -> Fields {
        fields([("description", self.description.clone().into())])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            name: r.string("name")?,
            description: r.opt_string("description")?,
        })
    }
}

/// A meeting of a body, identified by its video.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub body_id: String,
    pub event_datetime: DateTime<Utc>,
    pub source_uri: String,
    pub video_uri: String,
    pub agenda_file_uri: Option<String>,
    pub minutes_file_uri: Option<String>,
    pub external_event_id: Option<String>,
}

impl Entity for Event {
    const COLLECTION: &'static str = "event";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![("video_uri", self.video_uri.clone().into())]
    }

    fn payload(&self) -> Fields {
        fields([
            ("body_id", self.body_id.clone().into()),
            ("event_datetime", self.event_datetime.into()),
            ("source_uri", self.source_uri.clone().into()),
            ("agenda_file_uri", self.agenda_file_uri.clone().into()),
            ("minutes_file_uri", self.minutes_file_uri.clone().into()),
            ("external_event_id", self.external_event_id.clone().into()),
        ])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            body_id: r.string("body_id")?,
            event_datetime: r.timestamp("event_datetime")?,
            source_uri: r.string("source_uri")?,
            video_uri: r.string("video_uri")?,
            agenda_file_uri: r.opt_string("agenda_file_uri")?,
            minutes_file_uri: r.opt_string("minutes_file_uri")?,
            external_event_id: r.opt_string("external_event_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinutesItem {
    pub name: String,
    pub matter: Option<String>,
    pub external_item_id: Option<String>,
}

impl Entity for MinutesItem {
    const COLLECTION: &'static str = "minutes_item";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![("name", self.name.clone().into())]
    }

    fn payload(&self) -> Fields {
        fields([
            ("matter", self.matter.clone().into()),
            ("external_item_id", self.external_item_id.clone().into()),
        ])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            name: r.string("name")?,
            matter: r.opt_string("matter")?,
            external_item_id: r.opt_string("external_item_id")?,
        })
    }
}

/// Attachment link between a minutes item and a [`File`].
#[derive(Debug, Clone, PartialEq)]
pub struct MinutesItemFile {
    pub minutes_item_id: String,
    pub file_id: String,
    pub name: String,
}

impl Entity for MinutesItemFile {
    const COLLECTION: &'static str = "minutes_item_file";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("minutes_item_id", self.minutes_item_id.clone().into()),
            ("file_id", self.file_id.clone().into()),
        ]
    }

    fn payload(&self) -> Fields {
        fields([("name", self.name.clone().into())])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            minutes_item_id: r.string("minutes_item_id")?,
            file_id: r.string("file_id")?,
            name: r.string("name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventMinutesItem {
    pub event_id: String,
    pub minutes_item_id: String,
    pub index: i64,
    pub decision: Option<String>,
}

impl Entity for EventMinutesItem {
    const COLLECTION: &'static str = "event_minutes_item";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("event_id", self.event_id.clone().into()),
            ("minutes_item_id", self.minutes_item_id.clone().into()),
        ]
    }

    fn payload(&self) -> Fields {
        fields([
            ("index", self.index.into()),
            ("decision", self.decision.clone().into()),
        ])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            event_id: r.string("event_id")?,
            minutes_item_id: r.string("minutes_item_id")?,
            index: r.integer("index")?,
            decision: r.opt_string("decision")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub external_person_id: Option<String>,
}

impl Entity for Person {
    const COLLECTION: &'static str = "person";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("full_name", self.full_name.clone().into()),
            ("email", self.email.clone().into()),
        ]
    }

    fn payload(&self) -> Fields {
        fields([
            ("phone", self.phone.clone().into()),
            ("website", self.website.clone().into()),
            ("external_person_id", self.external_person_id.clone().into()),
        ])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            full_name: r.string("full_name")?,
            email: r.opt_string("email")?,
            phone: r.opt_string("phone")?,
            website: r.opt_string("website")?,
            external_person_id: r.opt_string("external_person_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub person_id: String,
    pub event_minutes_item_id: String,
    pub decision: String,
    pub external_vote_id: Option<String>,
}

impl Entity for Vote {
    const COLLECTION: &'static str = "vote";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("person_id", self.person_id.clone().into()),
            ("event_minutes_item_id", self.event_minutes_item_id.clone().into()),
        ]
    }

    fn payload(&self) -> Fields {
        fields([
            ("decision", self.decision.clone().into()),
            ("external_vote_id", self.external_vote_id.clone().into()),
        ])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            person_id: r.string("person_id")?,
            event_minutes_item_id: r.string("event_minutes_item_id")?,
            decision: r.string("decision")?,
            external_vote_id: r.opt_string("external_vote_id")?,
        })
    }
}

/// Any stored artifact. Identity is the uri, which for content-addressed
/// uploads embeds the content digest.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub uri: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub description: Option<String>,
}

impl File {
    /// A file record whose filename is the last path segment of its uri.
    pub fn from_uri(uri: impl Into<String>, content_type: Option<&str>) -> Self {
        let uri = uri.into();
        let filename = uri.rsplit('/').next().unwrap_or(&uri).to_string();
        Self {
            uri,
            filename,
            content_type: content_type.map(str::to_string),
            description: None,
        }
    }
}

impl Entity for File {
    const COLLECTION: &'static str = "file";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![("uri", self.uri.clone().into())]
    }

    fn payload(&self) -> Fields {
        fields([
            ("filename", self.filename.clone().into()),
            ("content_type", self.content_type.clone().into()),
            ("description", self.description.clone().into()),
        ])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            uri: r.string("uri")?,
            filename: r.string("filename")?,
            content_type: r.opt_string("content_type")?,
            description: r.opt_string("description")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub event_id: String,
    pub file_id: String,
    pub confidence: Option<f64>,
}

impl Entity for Transcript {
    const COLLECTION: &'static str = "transcript";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("event_id", self.event_id.clone().into()),
            ("file_id", self.file_id.clone().into()),
        ]
    }

    fn payload(&self) -> Fields {
        fields([("confidence", self.confidence.into())])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            event_id: r.string("event_id")?,
            file_id: r.string("file_id")?,
            confidence: r.opt_f64("confidence")?,
        })
    }
}

/// A versioned tracked operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Algorithm {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub source: Option<String>,
}

impl Algorithm {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            source: None,
        }
    }

    /// An algorithm versioned with this crate's version.
    pub fn current(name: impl Into<String>) -> Self {
        Self {
            source: Some(env!("CARGO_PKG_REPOSITORY").to_string()).filter(|s| !s.is_empty()),
            ..Self::new(name, env!("CARGO_PKG_VERSION"))
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Entity for Algorithm {
    const COLLECTION: &'static str = "algorithm";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", self.name.clone().into()),
            ("version", self.version.clone().into()),
        ]
    }

    fn payload(&self) -> Fields {
        fields([
            ("description", self.description.clone().into()),
            ("source", self.source.clone().into()),
        ])
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            name: r.string("name")?,
            version: r.string("version")?,
            description: r.opt_string("description")?,
            source: r.opt_string("source")?,
        })
    }
}

/// One execution of an [`Algorithm`].
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub algorithm_id: String,
    pub begin: DateTime<Utc>,
    pub completed: DateTime<Utc>,
}

impl Entity for Run {
    const COLLECTION: &'static str = "run";

    fn key(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("algorithm_id", self.algorithm_id.clone().into()),
            ("begin", self.begin.into()),
            ("completed", self.completed.into()),
        ]
    }

    fn payload(&self) -> Fields {
        Fields::new()
    }

    fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
        Ok(Self {
            algorithm_id: r.string("algorithm_id")?,
            begin: r.timestamp("begin")?,
            completed: r.timestamp("completed")?,
        })
    }
}

macro_rules! run_value_entity {
    ($(#[$meta:meta])* $name:ident, $collection:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            pub run_id: String,
            pub io_type: String,
            pub value: FieldValue,
        }

        impl Entity for $name {
            const COLLECTION: &'static str = $collection;

            fn key(&self) -> Vec<(&'static str, FieldValue)> {
                vec![
                    ("run_id", self.run_id.clone().into()),
                    ("type", self.io_type.clone().into()),
                    ("value", self.value.clone()),
                ]
            }

            fn payload(&self) -> Fields {
                Fields::new()
            }

            fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
                Ok(Self {
                    run_id: r.string("run_id")?,
                    io_type: r.string("type")?,
                    value: r.value("value"),
                })
            }
        }
    };
}

macro_rules! run_file_entity {
    ($(#[$meta:meta])* $name:ident, $collection:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            pub run_id: String,
            pub file_id: String,
        }

        impl Entity for $name {
            const COLLECTION: &'static str = $collection;

            fn key(&self) -> Vec<(&'static str, FieldValue)> {
                vec![
                    ("run_id", self.run_id.clone().into()),
                    ("file_id", self.file_id.clone().into()),
                ]
            }

            fn payload(&self) -> Fields {
                Fields::new()
            }

            fn decode(r: &FieldReader<'_>) -> Result<Self, StoreError> {
                Ok(Self {
                    run_id: r.string("run_id")?,
                    file_id: r.string("file_id")?,
                })
            }
        }
    };
}

run_value_entity!(
    /// A typed primitive consumed by a run.
    RunInput,
    "run_input"
);
run_value_entity!(
    /// A typed primitive produced by a run, including error details.
    RunOutput,
    "run_output"
);
run_file_entity!(RunInputFile, "run_input_file");
run_file_entity!(RunOutputFile, "run_output_file");
