//! In-process document store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::query::{Filter, Query};
use super::{Document, DocumentStore, InsertOutcome, StoreError};

type Collections = HashMap<String, Vec<Document>>;

/// Document store held in memory.
///
/// Clones share the same data, so a read-only view and a writable handle can
/// observe each other's records.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    collections: Arc<RwLock<Collections>>,
    writable: bool,
}

impl MemoryDocumentStore {
    /// Create an empty, writable store.
    pub fn new() -> Self {
        Self {
            collections: Arc::default(),
            writable: true,
        }
    }

    /// A handle over the same data that rejects writes.
    pub fn read_only(&self) -> Self {
        Self {
            collections: self.collections.clone(),
            writable: false,
        }
    }

    /// Number of documents in a collection.
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn describe(&self) -> String {
        format!("memory (writable: {})", self.writable)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id).cloned()))
    }

    async fn select(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let matched = self
            .collections
            .read()
            .await
            .get(&query.collection)
            .map(|docs| docs.iter().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default();
        Ok(query.finish(matched))
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::missing_credentials(format!("insert into {collection}")));
        }
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        key: &[Filter],
        document: Document,
    ) -> Result<InsertOutcome, StoreError> {
        if !self.writable {
            return Err(StoreError::missing_credentials(format!("insert into {collection}")));
        }

        // Check and write under one write lock.
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let existing: Vec<Document> = docs
            .iter()
            .filter(|d| key.iter().all(|f| f.matches(d)))
            .cloned()
            .collect();
        if !existing.is_empty() {
            return Ok(InsertOutcome::Existing(existing));
        }
        docs.push(document.clone());
        Ok(InsertOutcome::Inserted(document))
    }
}
