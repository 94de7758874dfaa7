//! Batch orchestration.
//!
//! One `run()` fetches the whole candidate batch, then fans the per-item
//! chain out across a bounded pool. A failing item is recorded and counted;
//! it never stops its siblings.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::blob::BlobStore;
use crate::cache::StageCache;
use crate::collaborators::{EventSource, SourceEvent};
use crate::erased::ItemChain;
use crate::model::{Algorithm, Event};
use crate::pipeline::PipelineError;
use crate::recorder::{Failure, RunRecorder, RunValue};
use crate::retry::RetryPolicy;
use crate::stages::{ingestion_pipeline, StageCollaborators};
use crate::store::{StoreError, UpsertStore};

/// An item that did not make it through its chain.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    pub video_uri: String,
    pub kind: String,
    pub message: String,
}

/// Outcome of one batch run.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: Vec<FailedItem>,
    pub began: DateTime<Utc>,
    pub completed: DateTime<Utc>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Processed,
    Skipped,
    Failed(FailedItem),
}

/// Default pool size: well above core count, since items mostly wait on I/O.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(4)
        .max(1)
}

/// Ingestion entry point.
pub struct PipelineOrchestrator {
    name: String,
    source: Arc<dyn EventSource>,
    chain: Arc<dyn ItemChain>,
    store: UpsertStore,
    recorder: RunRecorder,
    workers: usize,
    scratch: PathBuf,
}

/// Builder for constructing a [`PipelineOrchestrator`].
pub struct OrchestratorBuilder {
    store: UpsertStore,
    blobs: Arc<dyn BlobStore>,
    source: Arc<dyn EventSource>,
    collaborators: StageCollaborators,
    name: String,
    workers: usize,
    scratch: PathBuf,
    retry: RetryPolicy,
}

impl OrchestratorBuilder {
    pub fn new(
        store: UpsertStore,
        blobs: Arc<dyn BlobStore>,
        source: Arc<dyn EventSource>,
        collaborators: StageCollaborators,
    ) -> Self {
        Self {
            store,
            blobs,
            source,
            collaborators,
            name: "event_gather".to_string(),
            workers: default_workers(),
            scratch: std::env::temp_dir().join("councilflow"),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the pipeline name, used as the algorithm name prefix.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the worker pool size (at least 1).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the root for per-item scratch directories.
    pub fn scratch_dir(mut self, scratch: impl Into<PathBuf>) -> Self {
        self.scratch = scratch.into();
        self
    }

    /// Set the per-stage retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> PipelineOrchestrator {
        let recorder = RunRecorder::new(self.store.clone(), self.blobs.clone(), &self.scratch);
        let chain = ingestion_pipeline(
            &self.name,
            recorder.clone(),
            StageCache::new(self.blobs),
            self.collaborators,
            &self.scratch,
            self.retry,
        );
        PipelineOrchestrator {
            name: self.name,
            source: self.source,
            chain,
            store: self.store,
            recorder,
            workers: self.workers,
            scratch: self.scratch,
        }
    }
}

impl PipelineOrchestrator {
    pub fn builder(
        store: UpsertStore,
        blobs: Arc<dyn BlobStore>,
        source: Arc<dyn EventSource>,
        collaborators: StageCollaborators,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, blobs, source, collaborators)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process the whole batch once.
    ///
    /// Fails only when the batch itself cannot start (the event source or
    /// the batch run's own bookkeeping); item failures land in the summary.
    pub async fn run(&self) -> Result<BatchSummary, PipelineError> {
        let began = Utc::now();
        tracing::info!(pipeline = %self.name, workers = self.workers, "Batch started");

        let summary = self
            .recorder
            .track(
                Algorithm::current(format!("{}.run", self.name)),
                vec![RunValue::typed("workers", self.workers)],
                |batch| async move {
                    tokio::fs::create_dir_all(&self.scratch)
                        .await
                        .map_err(StoreError::from)?;
                    let events = self.list_events().await?;
                    let mut summary = self.dispatch(events, began).await;
                    summary.completed = Utc::now();

                    batch
                        .register_output(RunValue::typed("processed", summary.processed))
                        .await?;
                    batch
                        .register_output(RunValue::typed("skipped", summary.skipped))
                        .await?;
                    batch
                        .register_output(RunValue::typed("failed", summary.failed.len()))
                        .await?;
                    Ok::<_, PipelineError>(summary)
                },
            )
            .await?;

        tracing::info!(
            pipeline = %self.name,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            "Batch finished"
        );
        Ok(summary)
    }

    async fn list_events(&self) -> Result<Vec<SourceEvent>, PipelineError> {
        let source = self.source.clone();
        self.recorder
            .track(
                Algorithm::current("EventSource.list_events"),
                Vec::new(),
                |run| async move {
                    let events = source.list_events().await.map_err(PipelineError::Source)?;
                    run.register_output(RunValue::typed("events", events.len()))
                        .await?;
                    Ok(events)
                },
            )
            .await
    }

    async fn dispatch(&self, events: Vec<SourceEvent>, began: DateTime<Utc>) -> BatchSummary {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(events.len());

        for event in events {
            let video_uri = event.video_uri.clone();
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let item = ItemTask {
                name: self.name.clone(),
                chain: self.chain.clone(),
                store: self.store.clone(),
                recorder: self.recorder.clone(),
            };
            let handle = tokio::spawn(async move {
                // Hold the permit for the duration of the item.
                let _permit = permit;
                item.process(event).await
            });
            handles.push((video_uri, handle));
        }

        let mut summary = BatchSummary {
            processed: 0,
            skipped: 0,
            failed: Vec::new(),
            began,
            completed: began,
        };
        for (video_uri, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => ItemOutcome::Failed(FailedItem {
                    video_uri,
                    kind: "JoinError".to_string(),
                    message: e.to_string(),
                }),
            };
            match outcome {
                ItemOutcome::Processed => summary.processed += 1,
                ItemOutcome::Skipped => summary.skipped += 1,
                ItemOutcome::Failed(failed) => summary.failed.push(failed),
            }
        }
        summary
    }
}

/// Everything one spawned item needs, owned.
struct ItemTask {
    name: String,
    chain: Arc<dyn ItemChain>,
    store: UpsertStore,
    recorder: RunRecorder,
}

impl ItemTask {
    async fn process(self, event: SourceEvent) -> ItemOutcome {
        let video_uri = event.video_uri.clone();
        let inputs = vec![
            RunValue::typed("source_uri", event.source_uri.as_str()),
            RunValue::typed("video_uri", event.video_uri.as_str()),
        ];
        let chain = self.chain.clone();
        let store = self.store.clone();

        let result = AssertUnwindSafe(self.recorder.track(
            Algorithm::current(format!("{}.process_event", self.name)),
            inputs,
            |run| async move {
                let existing = store
                    .find::<Event>(&[("video_uri", event.video_uri.as_str().into())])
                    .await?;
                if let Some(existing) = existing {
                    run.register_output(RunValue::typed("skipped_event_id", existing.id.as_str()))
                        .await?;
                    return Ok(ItemOutcome::Skipped);
                }

                let ingested = chain.process(event).await?;
                run.register_output(RunValue::typed("event_id", ingested.event.id.as_str()))
                    .await?;
                Ok::<_, PipelineError>(ItemOutcome::Processed)
            },
        ))
        .catch_unwind()
        .await;

        match result {
            Ok(Ok(ItemOutcome::Skipped)) => {
                tracing::info!(video_uri = %video_uri, "Event already ingested, skipping");
                ItemOutcome::Skipped
            }
            Ok(Ok(outcome)) => {
                tracing::info!(video_uri = %video_uri, "Event ingested");
                outcome
            }
            Ok(Err(e)) => {
                tracing::error!(video_uri = %video_uri, kind = %e.kind(), error = %e, "Event failed");
                ItemOutcome::Failed(FailedItem {
                    video_uri,
                    kind: e.kind(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                tracing::error!(video_uri = %video_uri, "Event task panicked outside its run");
                ItemOutcome::Failed(FailedItem {
                    video_uri,
                    kind: "PipelineError::Panicked".to_string(),
                    message: "panicked while recording".to_string(),
                })
            }
        }
    }
}
