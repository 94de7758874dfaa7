//! Structured document storage.
//!
//! [`DocumentStore`] is the narrow seam every backend implements; the
//! find-or-create contract built on top of it lives in [`upsert`].

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod query;
mod rest;
pub mod upsert;
mod value;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryDocumentStore;
pub use query::{is_valid_field_name, Direction, Filter, Operator, OrderBy, Query};
pub use rest::{structured_query, RestDocumentStore, DEFAULT_REST_LIMIT};
pub use upsert::{Entity, FieldReader, Record, UpsertStore};
pub use value::{encode_timestamp, Document, FieldValue, Fields};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDocumentStore;

/// Error type for document and blob storage.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A key matched more records than it may identify.
    #[error("uniqueness violated in '{collection}' for key {fields:?}: {} matching records ({})", matches.len(), matches.join(", "))]
    Uniqueness {
        collection: String,
        fields: Vec<String>,
        matches: Vec<String>,
    },

    /// A write was attempted through a read-only connection.
    #[error("operation '{operation}' not permitted without credentials")]
    MissingCredentials { operation: String },

    #[error("no record '{id}' in '{collection}'")]
    NotFound { collection: String, id: String },

    /// A stored or transmitted payload could not be decoded.
    #[error("malformed '{collection}' payload at '{field}': {reason}")]
    Malformed {
        collection: String,
        field: String,
        reason: String,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Stable name of the error variant, recorded with failed runs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Uniqueness { .. } => "StoreError::Uniqueness",
            Self::MissingCredentials { .. } => "StoreError::MissingCredentials",
            Self::NotFound { .. } => "StoreError::NotFound",
            Self::Malformed { .. } => "StoreError::Malformed",
            Self::InvalidQuery(_) => "StoreError::InvalidQuery",
            Self::Backend(_) => "StoreError::Backend",
            Self::Io(_) => "StoreError::Io",
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Io(_))
    }

    pub(crate) fn missing_credentials(operation: impl Into<String>) -> Self {
        Self::MissingCredentials {
            operation: operation.into(),
        }
    }
}

/// Result of a conditional insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// No record matched the key; the given document was written.
    Inserted(Document),
    /// Records matching the key already existed; nothing was written.
    Existing(Vec<Document>),
}

/// Trait for structured storage backends.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend description for logs.
    fn describe(&self) -> String;

    /// Whether this connection may write.
    fn is_writable(&self) -> bool;

    /// Look up a single document by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Select documents matching every filter in the query.
    async fn select(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Write a document unconditionally.
    async fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    /// Write a document only if no document matches every key filter.
    ///
    /// Implementations must make the check and the write a single atomic
    /// step so concurrent callers racing on the same key converge on one record.
    async fn insert_if_absent(
        &self,
        collection: &str,
        key: &[Filter],
        document: Document,
    ) -> Result<InsertOutcome, StoreError>;
}
