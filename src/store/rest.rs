//! Read-only document store over an unauthenticated REST endpoint.
//!
//! This is the degraded path: anyone can read, nothing can be written, and
//! requests are rate limited client-side. Predicates are compiled into the
//! endpoint's structured-query body, where every primitive must carry an
//! explicit type tag because the wire encoding is otherwise untyped.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;

use super::query::{Direction, Filter, Operator, Query};
use super::value::Document;
use super::{DocumentStore, InsertOutcome, StoreError};

/// Limit applied when a query does not set one.
pub const DEFAULT_REST_LIMIT: usize = 1000;

/// Read-only REST document store.
pub struct RestDocumentStore {
    client: reqwest::Client,
    base_url: String,
    limiter: DefaultDirectRateLimiter,
}

impl RestDocumentStore {
    /// `base_url` is the documents root, e.g.
    /// `https://firestore.googleapis.com/v1/projects/<id>/databases/(default)/documents`.
    pub fn new(base_url: impl Into<String>, requests_per_second: u32) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        })
    }

    fn decode_document(&self, collection: &str, raw: &Value) -> Result<Document, StoreError> {
        let malformed = |field: &str, reason: String| StoreError::Malformed {
            collection: collection.to_string(),
            field: field.to_string(),
            reason,
        };
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("name", "missing document name".to_string()))?;
        // The id is the last segment of the resource name.
        let id = name.rsplit('/').next().unwrap_or(name);
        let empty = json!({});
        let fields = raw.get("fields").unwrap_or(&empty);
        Document::from_wire(id, fields).map_err(|reason| malformed("fields", reason))
    }
}

fn wire_operator(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "EQUAL",
        Operator::Gt => "GREATER_THAN",
        Operator::Lt => "LESS_THAN",
        Operator::GtEq => "GREATER_THAN_OR_EQUAL",
        Operator::LtEq => "LESS_THAN_OR_EQUAL",
        Operator::Contains => "ARRAY_CONTAINS",
    }
}

fn wire_filter(filter: &Filter) -> Value {
    if filter.op == Operator::Eq && filter.value.is_null() {
        return json!({
            "unaryFilter": { "op": "IS_NULL", "field": { "fieldPath": filter.field } }
        });
    }
    json!({
        "fieldFilter": {
            "field": { "fieldPath": filter.field },
            "op": wire_operator(filter.op),
            "value": filter.value.to_wire(),
        }
    })
}

/// Build the structured-query request body for a query.
pub fn structured_query(query: &Query) -> Value {
    let mut structured = json!({
        "from": [{ "collectionId": query.collection, "allDescendants": false }],
        "limit": query.limit.unwrap_or(DEFAULT_REST_LIMIT),
    });

    if !query.filters.is_empty() {
        structured["where"] = json!({
            "compositeFilter": {
                "op": "AND",
                "filters": query.filters.iter().map(wire_filter).collect::<Vec<_>>(),
            }
        });
    }

    if let Some(order) = &query.order_by {
        let direction = match order.direction {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        };
        structured["orderBy"] = json!([{
            "field": { "fieldPath": order.field },
            "direction": direction,
        }]);
    }

    json!({ "structuredQuery": structured })
}

#[async_trait]
impl DocumentStore for RestDocumentStore {
    fn describe(&self) -> String {
        format!("rest {} (read-only)", self.base_url)
    }

    fn is_writable(&self) -> bool {
        false
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.limiter.until_ready().await;

        let url = format!("{}/{}/{}", self.base_url, collection, id);
        tracing::debug!(url = %url, "Fetching document");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }

        let raw: Value = response.json().await.map_err(|e| StoreError::Malformed {
            collection: collection.to_string(),
            field: "body".to_string(),
            reason: e.to_string(),
        })?;
        self.decode_document(collection, &raw).map(Some)
    }

    async fn select(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.limiter.until_ready().await;

        let url = format!("{}:runQuery", self.base_url);
        let body = structured_query(query);
        tracing::debug!(collection = %query.collection, filters = query.filters.len(), "Running structured query");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!("query failed ({status}): {text}")));
        }

        let entries: Vec<Value> = response.json().await.map_err(|e| StoreError::Malformed {
            collection: query.collection.clone(),
            field: "body".to_string(),
            reason: e.to_string(),
        })?;

        // Entries without a `document` only carry read metadata.
        entries
            .iter()
            .filter_map(|entry| entry.get("document"))
            .map(|raw| self.decode_document(&query.collection, raw))
            .collect()
    }

    async fn insert(&self, collection: &str, _document: Document) -> Result<(), StoreError> {
        Err(StoreError::missing_credentials(format!("insert into {collection}")))
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        _key: &[Filter],
        _document: Document,
    ) -> Result<InsertOutcome, StoreError> {
        Err(StoreError::missing_credentials(format!("insert into {collection}")))
    }
}
