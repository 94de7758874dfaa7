//! Provenance recording for tracked operations.
//!
//! A run is scoped: [`RunRecorder::track`] opens it, hands the body an
//! [`ActiveRun`] for registering inputs and outputs, and always closes it,
//! whether the body returns, fails or panics. A failing body leaves behind a
//! run with its error kind, message and a trace artifact among the outputs.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::blob::{content_digest, content_type_for, BlobStore};
use crate::model::{Algorithm, File, Run, RunInput, RunInputFile, RunOutput, RunOutputFile};
use crate::store::{FieldValue, Record, StoreError, UpsertStore};

/// An error that can be recorded as the outcome of a run.
pub trait Failure: fmt::Display + fmt::Debug + Send + Sync + Sized {
    /// Stable name of the error type, stored as the RunIO type.
    fn kind(&self) -> String;

    /// Build the error reported when the tracked body panics.
    fn panicked(message: String) -> Self;
}

/// A value registered as a run input or output.
#[derive(Debug, Clone, PartialEq)]
pub enum RunValue {
    /// A local file; promoted to the blob store under its content digest.
    Artifact(PathBuf),
    /// A blob already in the store, linked by its URI.
    Stored(String),
    /// A primitive stored with its own type name.
    Value(FieldValue),
    /// A primitive stored under an explicit type name.
    Typed { io_type: String, value: FieldValue },
}

impl RunValue {
    pub fn typed(io_type: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::Typed {
            io_type: io_type.into(),
            value: value.into(),
        }
    }

    /// Stringify anything else.
    pub fn display(value: impl fmt::Display) -> Self {
        Self::Value(FieldValue::String(value.to_string()))
    }
}

impl From<FieldValue> for RunValue {
    fn from(value: FieldValue) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for RunValue {
    fn from(value: &str) -> Self {
        Self::Value(value.into())
    }
}

impl From<String> for RunValue {
    fn from(value: String) -> Self {
        Self::Value(value.into())
    }
}

impl From<i64> for RunValue {
    fn from(value: i64) -> Self {
        Self::Value(value.into())
    }
}

impl From<f64> for RunValue {
    fn from(value: f64) -> Self {
        Self::Value(value.into())
    }
}

impl From<bool> for RunValue {
    fn from(value: bool) -> Self {
        Self::Value(value.into())
    }
}

impl From<PathBuf> for RunValue {
    fn from(path: PathBuf) -> Self {
        Self::Artifact(path)
    }
}

#[derive(Debug)]
enum Registered {
    File { file_id: String },
    Value { io_type: String, value: FieldValue },
}

#[derive(Debug, Default)]
struct RunState {
    inputs: Vec<Registered>,
    outputs: Vec<Registered>,
    finished: bool,
}

struct RecorderInner {
    store: UpsertStore,
    blobs: Arc<dyn BlobStore>,
    scratch: PathBuf,
}

/// Opens and persists runs.
#[derive(Clone)]
pub struct RunRecorder {
    inner: Arc<RecorderInner>,
}

/// A run in progress.
///
/// Clones share the same registrations.
#[derive(Clone)]
pub struct ActiveRun {
    recorder: Arc<RecorderInner>,
    algorithm: Arc<Algorithm>,
    begin: DateTime<Utc>,
    state: Arc<Mutex<RunState>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl RunRecorder {
    /// `scratch` holds transient trace files before they are promoted.
    pub fn new(store: UpsertStore, blobs: Arc<dyn BlobStore>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                store,
                blobs,
                scratch: scratch.into(),
            }),
        }
    }

    pub fn store(&self) -> &UpsertStore {
        &self.inner.store
    }

    /// Open a run without a guard. Prefer [`RunRecorder::track`].
    pub fn begin(&self, algorithm: Algorithm) -> ActiveRun {
        ActiveRun {
            recorder: self.inner.clone(),
            algorithm: Arc::new(algorithm),
            begin: Utc::now(),
            state: Arc::default(),
        }
    }

    /// Run `body` inside a tracked run.
    ///
    /// The run is persisted on every exit path. On failure the error kind,
    /// message and a trace artifact are registered as outputs before the run
    /// is closed, and the original error is returned.
    pub async fn track<T, E, F, Fut>(
        &self,
        algorithm: Algorithm,
        inputs: Vec<RunValue>,
        body: F,
    ) -> Result<T, E>
    where
        T: Send,
        E: Failure + From<StoreError>,
        F: FnOnce(ActiveRun) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let run = self.begin(algorithm);
        tracing::debug!(algorithm = %run.algorithm.name, "Run started");

        let mut registered = Ok(());
        for input in inputs {
            registered = run.register_input(input).await;
            if registered.is_err() {
                break;
            }
        }

        let outcome = match registered {
            Err(e) => Err(E::from(e)),
            Ok(()) => match AssertUnwindSafe(body(run.clone())).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(E::panicked(panic_message(payload.as_ref()))),
            },
        };

        match outcome {
            Ok(value) => {
                let record = run.finish().await?;
                tracing::debug!(algorithm = %run.algorithm.name, run_id = %record.id, "Run completed");
                Ok(value)
            }
            Err(err) => {
                run.register_failure(&err).await;
                match run.finish().await {
                    Ok(record) => tracing::warn!(
                        algorithm = %run.algorithm.name,
                        run_id = %record.id,
                        kind = %err.kind(),
                        error = %err,
                        "Run failed"
                    ),
                    Err(persist) => tracing::error!(
                        algorithm = %run.algorithm.name,
                        kind = %err.kind(),
                        error = %err,
                        persist_error = %persist,
                        "Run failed and could not be recorded"
                    ),
                }
                Err(err)
            }
        }
    }
}

impl ActiveRun {
    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.begin
    }

    pub async fn register_input(&self, value: impl Into<RunValue>) -> Result<(), StoreError> {
        let registered = self.resolve(value.into()).await?;
        self.state.lock().await.inputs.push(registered);
        Ok(())
    }

    pub async fn register_output(&self, value: impl Into<RunValue>) -> Result<(), StoreError> {
        let registered = self.resolve(value.into()).await?;
        self.state.lock().await.outputs.push(registered);
        Ok(())
    }

    /// Register the error kind, message and a trace artifact as outputs.
    ///
    /// Registration problems are logged; they never mask the failure itself.
    pub async fn register_failure<E: Failure>(&self, err: &E) {
        let kind = err.kind();
        if let Err(e) = self
            .register_output(RunValue::typed(kind.clone(), err.to_string()))
            .await
        {
            tracing::warn!(error = %e, "Could not register error output");
        }

        let trace = self
            .recorder
            .scratch
            .join(format!("exception_log_{}.err", Uuid::new_v4()));
        let written = async {
            tokio::fs::create_dir_all(&self.recorder.scratch).await?;
            tokio::fs::write(&trace, format!("{kind}: {err:?}\n")).await
        }
        .await;
        match written {
            Ok(()) => {
                if let Err(e) = self.register_output(RunValue::Artifact(trace.clone())).await {
                    tracing::warn!(error = %e, "Could not register trace artifact");
                }
                let _ = tokio::fs::remove_file(&trace).await;
            }
            Err(e) => tracing::warn!(error = %e, "Could not write trace artifact"),
        }
    }

    /// Close the run and persist it with every registered value.
    pub async fn finish(&self) -> Result<Record<Run>, StoreError> {
        let completed = Utc::now();
        let (inputs, outputs) = {
            let mut state = self.state.lock().await;
            if state.finished {
                return Err(StoreError::Backend(format!(
                    "run of '{}' already finished",
                    self.algorithm.name
                )));
            }
            state.finished = true;
            (
                std::mem::take(&mut state.inputs),
                std::mem::take(&mut state.outputs),
            )
        };

        let store = &self.recorder.store;
        let algorithm = store.get_or_upload(self.algorithm.as_ref()).await?;
        let run = store
            .get_or_upload(&Run {
                algorithm_id: algorithm.id,
                begin: self.begin,
                completed,
            })
            .await?;

        for registered in inputs {
            match registered {
                Registered::File { file_id } => {
                    store
                        .get_or_upload(&RunInputFile {
                            run_id: run.id.clone(),
                            file_id,
                        })
                        .await?;
                }
                Registered::Value { io_type, value } => {
                    store
                        .get_or_upload(&RunInput {
                            run_id: run.id.clone(),
                            io_type,
                            value,
                        })
                        .await?;
                }
            }
        }

        for registered in outputs {
            match registered {
                Registered::File { file_id } => {
                    store
                        .get_or_upload(&RunOutputFile {
                            run_id: run.id.clone(),
                            file_id,
                        })
                        .await?;
                }
                Registered::Value { io_type, value } => {
                    store
                        .get_or_upload(&RunOutput {
                            run_id: run.id.clone(),
                            io_type,
                            value,
                        })
                        .await?;
                }
            }
        }

        Ok(run)
    }

    async fn resolve(&self, value: RunValue) -> Result<Registered, StoreError> {
        match value {
            RunValue::Artifact(path) => Ok(Registered::File {
                file_id: self.promote(&path).await?,
            }),
            RunValue::Stored(uri) => {
                let content_type = content_type_for(&uri);
                let file = self
                    .recorder
                    .store
                    .get_or_upload(&File::from_uri(uri, content_type))
                    .await?;
                Ok(Registered::File { file_id: file.id })
            }
            RunValue::Value(value) => Ok(Registered::Value {
                io_type: value.type_name().to_string(),
                value,
            }),
            RunValue::Typed { io_type, value } => Ok(Registered::Value { io_type, value }),
        }
    }

    /// Upload a local file under its content digest and link it as a File.
    async fn promote(&self, path: &Path) -> Result<String, StoreError> {
        let digest = content_digest(path).await?;
        let name = match path.extension() {
            Some(ext) => format!("{digest}.{}", ext.to_string_lossy()),
            None => digest.clone(),
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());

        let uri = self.recorder.blobs.upload(path, &name).await?;
        let file = self
            .recorder
            .store
            .get_or_upload(&File {
                uri,
                content_type: content_type_for(&filename).map(str::to_string),
                filename,
                description: None,
            })
            .await?;
        Ok(file.id)
    }
}
