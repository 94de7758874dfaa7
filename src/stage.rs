//! Stage trait and error types.

use async_trait::async_trait;
use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::recorder::{ActiveRun, Failure};
use crate::store::StoreError;

/// Error returned by a stage execution.
#[derive(Error, Debug)]
pub enum StageError {
    /// Transient failure - worth retrying.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - won't succeed on retry.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl StageError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Retryable(e) | Self::Permanent(e) => e,
        }
    }

    pub fn inner(&self) -> &anyhow::Error {
        match self {
            Self::Retryable(e) | Self::Permanent(e) => e,
        }
    }
}

/// Stable name of the underlying error type.
pub fn error_kind(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<StoreError>() {
        return e.kind().to_string();
    }
    if let Some(e) = err.downcast_ref::<CollaboratorError>() {
        return e.kind().to_string();
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return "std::io::Error".to_string();
    }
    "anyhow::Error".to_string()
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            Self::Retryable(err.into())
        } else {
            Self::Permanent(err.into())
        }
    }
}

impl From<CollaboratorError> for StageError {
    fn from(err: CollaboratorError) -> Self {
        if err.is_transient() {
            Self::Retryable(err.into())
        } else {
            Self::Permanent(err.into())
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::Retryable(err.into())
    }
}

impl Failure for StageError {
    fn kind(&self) -> String {
        error_kind(self.inner())
    }

    fn panicked(message: String) -> Self {
        Self::Permanent(anyhow::anyhow!("stage panicked: {message}"))
    }
}

/// A single dependent stage in the per-item chain.
///
/// Each execution runs inside its own tracked run; `run` is the handle for
/// registering the stage's inputs and outputs.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The input type this stage accepts.
    type Input: Send + Sync + Clone;

    /// The output type this stage produces.
    type Output: Send + Sync;

    /// The name of this stage for logging and recording.
    fn name(&self) -> &'static str;

    /// Execute the stage with the given input.
    async fn execute(
        &self,
        input: Self::Input,
        run: &ActiveRun,
    ) -> Result<Self::Output, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_classify_by_transience() {
        let backend: StageError = StoreError::Backend("timeout".into()).into();
        assert!(backend.is_retryable());
        assert_eq!(backend.kind(), "StoreError::Backend");

        let uniqueness: StageError = StoreError::Uniqueness {
            collection: "event".into(),
            fields: vec!["video_uri".into()],
            matches: vec!["a".into(), "b".into()],
        }
        .into();
        assert!(!uniqueness.is_retryable());
        assert_eq!(uniqueness.kind(), "StoreError::Uniqueness");
    }

    #[test]
    fn collaborator_kind_survives_context() {
        let err = StageError::permanent(
            anyhow::Error::from(CollaboratorError::upstream("ffmpeg", "exit 1"))
                .context("extracting audio"),
        );
        assert_eq!(err.kind(), "CollaboratorError::Upstream");
    }
}
