//! # Councilflow
//!
//! Idempotent, provenance-tracked ingestion of meeting recordings.
//!
//! Each candidate meeting from an [`EventSource`] runs through three
//! dependent stages: audio extraction, transcription (from published
//! captions when possible) and upload of the meeting's entity graph. The stages share three guarantees:
//!
//! - **Re-runs resume.** Every expensive artifact is cached in the blob store
//!   under a name derived from the item's video locator; a cache hit skips
//!   the stage.
//! - **Writes converge.** Structured writes go through
//!   [`UpsertStore::get_or_upload`], which finds a record by its key or
//!   creates it, and never updates what it finds.
//! - **Everything is on record.** Every stage attempt, item and batch is a
//!   [`Run`](model::Run) with its inputs, outputs and, on failure, the error.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use councilflow::Config;
//!
//! let orchestrator = Config::load("councilflow.toml".as_ref())?.build().await?;
//! let summary = orchestrator.run().await?;
//! println!("{} processed, {} failed", summary.processed, summary.failed.len());
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite document store

pub mod blob;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod erased;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod recorder;
pub mod retry;
pub mod stage;
pub mod stages;
pub mod store;

pub use blob::{BlobStore, HttpBlobStore, LocalBlobStore};
pub use cache::StageCache;
pub use collaborators::{
    AudioExtractor, CaptionEngine, CollaboratorError, EventSource, MediaFetcher, Representation,
    SourceEvent, TranscriptionEngine,
};
pub use config::{Config, ConfigError};
pub use erased::ItemChain;
pub use orchestrator::{BatchSummary, FailedItem, OrchestratorBuilder, PipelineOrchestrator};
pub use pipeline::{BuiltPipeline, HasEntityId, Pipeline, PipelineError};
pub use recorder::{ActiveRun, Failure, RunRecorder, RunValue};
pub use retry::RetryPolicy;
pub use stage::{Stage, StageError};
pub use stages::{AudioStage, StageCollaborators, TranscriptStage, UploadStage};
pub use store::{
    DocumentStore, Entity, MemoryDocumentStore, Query, Record, StoreError, UpsertStore,
};

#[cfg(feature = "sqlite")]
pub use store::SqliteDocumentStore;
