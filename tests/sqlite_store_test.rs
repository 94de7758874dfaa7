//! Integration tests for the SQLite document store.
#![cfg(feature = "sqlite")]

mod common;

use common::{council_meeting, Harness};
use councilflow::collaborators::StaticEventSource;
use councilflow::model::{Body, EventMinutesItem, Person};
use councilflow::store::{Direction, Document, FieldValue, Fields, Filter, Operator};
use councilflow::{
    DocumentStore, PipelineOrchestrator, Query, SqliteDocumentStore, StoreError, UpsertStore,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

const VIDEO: &str = "https://video.example.gov/council/2024-03-04.mp4";

async fn pool() -> SqlitePool {
    // One connection, so every handle sees the same in-memory database.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn setup() -> (SqlitePool, UpsertStore) {
    let pool = pool().await;
    let documents = SqliteDocumentStore::new(pool.clone());
    documents.run_migrations().await.unwrap();
    (pool, UpsertStore::new(Arc::new(documents)))
}

fn body(name: &str) -> Body {
    Body {
        name: name.to_string(),
        description: None,
    }
}

async fn count(pool: &SqlitePool, collection: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM cf_documents WHERE collection = ?")
        .bind(collection)
        .fetch_one(pool)
        .await
        .unwrap()
}

fn person(full_name: &str, email: Option<&str>) -> Person {
    Person {
        full_name: full_name.to_string(),
        email: email.map(str::to_string),
        phone: None,
        website: None,
        external_person_id: None,
    }
}

fn agenda_entry(event_id: &str, item: &str, index: i64) -> EventMinutesItem {
    EventMinutesItem {
        event_id: event_id.to_string(),
        minutes_item_id: item.to_string(),
        index,
        decision: None,
    }
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let (_pool, store) = setup().await;

    let first = store.get_or_upload(&body("City Council")).await.unwrap();
    let second = store.get_or_upload(&body("City Council")).await.unwrap();
    assert_eq!(first.id, second.id);

    let all = store
        .select::<Body>(Query::collection("body"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_null_key_fields_match() {
    let (pool, store) = setup().await;
    let unlisted = person("Dana Ortiz", None);
    let listed = person("Dana Ortiz", Some("dana.ortiz@example.gov"));

    let first = store.get_or_upload(&unlisted).await.unwrap();
    let with_email = store.get_or_upload(&listed).await.unwrap();
    let second = store.get_or_upload(&unlisted).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_ne!(first.id, with_email.id);
    assert_eq!(second.data.email, None);
    assert_eq!(count(&pool, "person").await, 2);

    let found = store
        .find::<Person>(&[
            ("full_name", "Dana Ortiz".into()),
            ("email", FieldValue::Null),
        ])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);
}

#[tokio::test]
async fn test_duplicate_matches_are_a_uniqueness_error() {
    let (pool, store) = setup().await;
    let documents = SqliteDocumentStore::new(pool.clone());
    for id in ["dup-1", "dup-2"] {
        let mut fields = Fields::new();
        fields.insert("name".to_string(), FieldValue::from("Parks Committee"));
        fields.insert("description".to_string(), FieldValue::Null);
        documents
            .insert("body", Document::new(id, fields))
            .await
            .unwrap();
    }

    let err = store
        .get_or_upload(&body("Parks Committee"))
        .await
        .unwrap_err();
    match err {
        StoreError::Uniqueness {
            collection,
            matches,
            ..
        } => {
            assert_eq!(collection, "body");
            assert_eq!(matches.len(), 2);
        }
        other => panic!("expected uniqueness violation, got {other:?}"),
    }
    assert_eq!(count(&pool, "body").await, 2);
}

#[tokio::test]
async fn test_contains_matches_array_members() {
    let (pool, _store) = setup().await;
    let documents = SqliteDocumentStore::new(pool);
    for (id, tags) in [("a", vec!["zoning", "budget"]), ("b", vec!["transit"])] {
        let mut fields = Fields::new();
        fields.insert(
            "tags".to_string(),
            FieldValue::Array(tags.into_iter().map(FieldValue::from).collect()),
        );
        documents
            .insert("agenda_tag", Document::new(id, fields))
            .await
            .unwrap();
    }

    let hits = documents
        .select(&Query::collection("agenda_tag").filter(Filter::new(
            "tags",
            Operator::Contains,
            "zoning",
        )))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "a");

    let misses = documents
        .select(&Query::collection("agenda_tag").filter(Filter::new(
            "tags",
            Operator::Contains,
            "parks",
        )))
        .await
        .unwrap();
    assert!(misses.is_empty());
}

#[tokio::test]
async fn test_read_only_rejects_creation() {
    let (pool, writer) = setup().await;
    writer.get_or_upload(&body("City Council")).await.unwrap();

    let reader = UpsertStore::new(Arc::new(SqliteDocumentStore::read_only(pool)));
    assert!(reader.get_or_upload(&body("City Council")).await.is_ok());

    let err = reader.get_or_upload(&body("Transit Board")).await.unwrap_err();
    assert!(matches!(err, StoreError::MissingCredentials { .. }));
}

#[tokio::test]
async fn test_query_operators_and_ordering() {
    let (_pool, store) = setup().await;
    for (item, index) in [("m-a", 2), ("m-b", 0), ("m-c", 1), ("m-d", 3)] {
        store
            .get_or_upload(&agenda_entry("event-1", item, index))
            .await
            .unwrap();
    }
    store
        .get_or_upload(&agenda_entry("event-2", "m-a", 0))
        .await
        .unwrap();

    let ordered = store
        .select::<EventMinutesItem>(
            Query::collection("event_minutes_item")
                .where_eq("event_id", "event-1")
                .order_by("index", Direction::Ascending),
        )
        .await
        .unwrap();
    let items: Vec<&str> = ordered
        .iter()
        .map(|r| r.data.minutes_item_id.as_str())
        .collect();
    assert_eq!(items, vec!["m-b", "m-c", "m-a", "m-d"]);

    let later = store
        .select::<EventMinutesItem>(
            Query::collection("event_minutes_item")
                .where_eq("event_id", "event-1")
                .filter(Filter::new("index", Operator::GtEq, 2i64))
                .order_by("index", Direction::Descending)
                .limit(1),
        )
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].data.minutes_item_id, "m-d");
}

#[tokio::test]
async fn test_get_by_id() {
    let (pool, store) = setup().await;
    let created = store.get_or_upload(&body("City Council")).await.unwrap();

    let fetched = store.get::<Body>(&created.id).await.unwrap();
    assert_eq!(fetched, created);

    let documents = SqliteDocumentStore::new(pool);
    assert!(documents.get("body", "no-such-id").await.unwrap().is_none());
    assert!(matches!(
        store.get::<Body>("no-such-id").await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_upserts_converge() {
    let (_pool, store) = setup().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.get_or_upload(&body("City Council")).await.unwrap().id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn test_pipeline_run_and_rerun() {
    let (pool, store) = setup().await;
    let harness = Harness::new();
    let orchestrator = PipelineOrchestrator::builder(
        store,
        harness.blob_store(),
        Arc::new(StaticEventSource::new(vec![council_meeting(VIDEO)])),
        harness.collaborators(),
    )
    .scratch_dir(harness.scratch())
    .build();

    let first = orchestrator.run().await.unwrap();
    assert_eq!(first.processed, 1);
    assert!(first.is_clean());

    let expected: [(&str, i64); 6] = [
        ("body", 1),
        ("event", 1),
        ("minutes_item", 2),
        ("event_minutes_item", 2),
        ("transcript", 1),
        ("file", 7),
    ];
    for (collection, n) in expected {
        assert_eq!(count(&pool, collection).await, n, "{collection}");
    }

    let second = orchestrator.run().await.unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped, 1);
    for (collection, n) in expected {
        assert_eq!(count(&pool, collection).await, n, "{collection}");
    }
    assert_eq!(harness.extractor.calls(), 1);
}
