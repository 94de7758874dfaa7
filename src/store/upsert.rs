//! Find-or-create over any [`DocumentStore`].
//!
//! `upsert` never updates: a match returns the stored record untouched and
//! the new payload is discarded. More matches than a key may identify is a
//! data-integrity violation and is reported, never resolved.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::query::{Filter, Query};
use super::value::{Document, FieldValue, Fields};
use super::{DocumentStore, InsertOutcome, StoreError};

/// A typed record persisted in one collection under a composite key.
pub trait Entity: Sized + Send + Sync {
    /// Collection the entity lives in.
    const COLLECTION: &'static str;

    /// Ordered key fields that identify at most one record.
    fn key(&self) -> Vec<(&'static str, FieldValue)>;

    /// Full payload written on creation (may repeat the key fields).
    fn payload(&self) -> Fields;

    /// Decode a stored document.
    fn decode(fields: &FieldReader<'_>) -> Result<Self, StoreError>;
}

/// A decoded entity together with its store id.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<E> {
    pub id: String,
    pub data: E,
}

/// Typed accessors over a document's fields.
pub struct FieldReader<'a> {
    collection: &'static str,
    document: &'a Document,
}

impl<'a> FieldReader<'a> {
    pub fn new(collection: &'static str, document: &'a Document) -> Self {
        Self {
            collection,
            document,
        }
    }

    fn malformed(&self, field: &str, reason: &str) -> StoreError {
        StoreError::Malformed {
            collection: self.collection.to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    fn present(&self, field: &str) -> Option<&'a FieldValue> {
        self.document.get(field).filter(|v| !v.is_null())
    }

    pub fn string(&self, field: &str) -> Result<String, StoreError> {
        self.opt_string(field)?
            .ok_or_else(|| self.malformed(field, "missing string"))
    }

    pub fn opt_string(&self, field: &str) -> Result<Option<String>, StoreError> {
        match self.present(field) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| self.malformed(field, "expected string")),
        }
    }

    pub fn integer(&self, field: &str) -> Result<i64, StoreError> {
        self.present(field)
            .and_then(FieldValue::as_i64)
            .ok_or_else(|| self.malformed(field, "expected integer"))
    }

    pub fn opt_f64(&self, field: &str) -> Result<Option<f64>, StoreError> {
        match self.present(field) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.malformed(field, "expected number")),
        }
    }

    pub fn timestamp(&self, field: &str) -> Result<DateTime<Utc>, StoreError> {
        self.present(field)
            .and_then(FieldValue::as_timestamp)
            .ok_or_else(|| self.malformed(field, "expected timestamp"))
    }

    /// Any value, `Null` when absent.
    pub fn value(&self, field: &str) -> FieldValue {
        self.document.get(field).cloned().unwrap_or(FieldValue::Null)
    }
}

/// Idempotent upsert store shared by every worker.
///
/// Cheap to clone; all clones talk to the same backend.
#[derive(Clone)]
pub struct UpsertStore {
    backend: Arc<dyn DocumentStore>,
}

impl UpsertStore {
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentStore> {
        &self.backend
    }

    /// Find the record matching every key field, or create it.
    ///
    /// Returns the existing record unchanged on a single match, writes a new
    /// record with a random id on no match, and fails with
    /// [`StoreError::Uniqueness`] on several matches.
    pub async fn upsert(
        &self,
        collection: &str,
        key: &[(&str, FieldValue)],
        payload: Fields,
    ) -> Result<Document, StoreError> {
        let filters: Vec<Filter> = key
            .iter()
            .map(|(field, value)| Filter::eq(*field, value.clone()))
            .collect();

        let query = Query::collection(collection).filters(filters.iter().cloned());
        let mut matches = self.backend.select(&query).await?;
        match matches.len() {
            0 => {}
            1 => return Ok(matches.remove(0)),
            _ => return Err(uniqueness(collection, key, &matches)),
        }

        if !self.backend.is_writable() {
            return Err(StoreError::missing_credentials(format!("upsert into {collection}")));
        }

        let mut fields = payload;
        for (field, value) in key {
            fields.insert((*field).to_string(), value.clone());
        }
        let document = Document::new(Uuid::new_v4().to_string(), fields);

        match self
            .backend
            .insert_if_absent(collection, &filters, document)
            .await?
        {
            InsertOutcome::Inserted(document) => {
                tracing::debug!(collection = %collection, id = %document.id, "Created record");
                Ok(document)
            }
            InsertOutcome::Existing(mut existing) => {
                if existing.len() > 1 {
                    return Err(uniqueness(collection, key, &existing));
                }
                tracing::debug!(collection = %collection, "Concurrent writer created record first");
                Ok(existing.remove(0))
            }
        }
    }

    /// Typed find-or-create.
    pub async fn get_or_upload<E: Entity>(&self, entity: &E) -> Result<Record<E>, StoreError> {
        let document = self
            .upsert(E::COLLECTION, &entity.key(), entity.payload())
            .await?;
        decode(&document)
    }

    /// Typed lookup by key without creating anything.
    ///
    /// Errors with [`StoreError::Uniqueness`] if more than one record matches.
    pub async fn find<E: Entity>(
        &self,
        key: &[(&str, FieldValue)],
    ) -> Result<Option<Record<E>>, StoreError> {
        let query = Query::collection(E::COLLECTION)
            .filters(key.iter().map(|(f, v)| Filter::eq(*f, v.clone())));
        let mut matches = self.backend.select(&query).await?;
        match matches.len() {
            0 => Ok(None),
            1 => decode(&matches.remove(0)).map(Some),
            _ => Err(uniqueness(E::COLLECTION, key, &matches)),
        }
    }

    /// Typed selection.
    pub async fn select<E: Entity>(&self, query: Query) -> Result<Vec<Record<E>>, StoreError> {
        let query = Query {
            collection: E::COLLECTION.to_string(),
            ..query
        };
        self.backend
            .select(&query)
            .await?
            .iter()
            .map(decode)
            .collect()
    }

    /// Typed lookup by id.
    pub async fn get<E: Entity>(&self, id: &str) -> Result<Record<E>, StoreError> {
        let document = self
            .backend
            .get(E::COLLECTION, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: E::COLLECTION.to_string(),
                id: id.to_string(),
            })?;
        decode(&document)
    }
}

fn decode<E: Entity>(document: &Document) -> Result<Record<E>, StoreError> {
    let data = E::decode(&FieldReader::new(E::COLLECTION, document))?;
    Ok(Record {
        id: document.id.clone(),
        data,
    })
}

fn uniqueness(collection: &str, key: &[(&str, FieldValue)], matches: &[Document]) -> StoreError {
    StoreError::Uniqueness {
        collection: collection.to_string(),
        fields: key.iter().map(|(f, _)| (*f).to_string()).collect(),
        matches: matches.iter().map(|d| d.id.clone()).collect(),
    }
}
