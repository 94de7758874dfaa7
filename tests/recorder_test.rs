//! Provenance recording: every tracked call leaves a complete run behind.

mod common;

use common::Harness;
use councilflow::blob::digest_str;
use councilflow::model::{Algorithm, File};
use councilflow::store::FieldValue;
use councilflow::{Failure, RunValue, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
enum TestError {
    #[error("upstream failed: {0}")]
    Upstream(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("panicked: {0}")]
    Panicked(String),
}

impl Failure for TestError {
    fn kind(&self) -> String {
        match self {
            Self::Upstream(_) => "TestError::Upstream".to_string(),
            Self::Store(e) => e.kind().to_string(),
            Self::Panicked(_) => "TestError::Panicked".to_string(),
        }
    }

    fn panicked(message: String) -> Self {
        Self::Panicked(message)
    }
}

#[tokio::test]
async fn successful_run_records_inputs_and_outputs() {
    let harness = Harness::new();
    let recorder = harness.recorder();

    let artifact = harness.dir.path().join("summary.txt");
    tokio::fs::write(&artifact, b"two items on the agenda").await.unwrap();

    let result = recorder
        .track(
            Algorithm::current("tests.summarize"),
            vec![
                RunValue::typed("video_uri", "https://video.example.gov/a.mp4"),
                RunValue::from(2i64),
            ],
            |run| {
                let artifact = artifact.clone();
                async move {
                    run.register_output(RunValue::Artifact(artifact)).await?;
                    run.register_output("done").await?;
                    Ok::<_, TestError>(7)
                }
            },
        )
        .await
        .unwrap();
    assert_eq!(result, 7);

    let runs = harness.runs_of("tests.summarize").await;
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert!(run.data.completed >= run.data.begin);

    let inputs = harness.inputs_of(&run.id).await;
    assert_eq!(inputs.len(), 2);
    assert!(inputs.iter().any(|i| i.data.io_type == "video_uri"
        && i.data.value == FieldValue::from("https://video.example.gov/a.mp4")));
    assert!(inputs
        .iter()
        .any(|i| i.data.io_type == "int" && i.data.value == FieldValue::Integer(2)));

    let outputs = harness.outputs_of(&run.id).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].data.io_type, "str");

    let files = harness.output_files_of(&run.id).await;
    assert_eq!(files.len(), 1);
    let file = harness.store.get::<File>(&files[0].data.file_id).await.unwrap();
    assert_eq!(file.data.filename, "summary.txt");
    assert!(file
        .data
        .uri
        .ends_with(&format!("{}.txt", digest_str("two items on the agenda"))));
}

#[tokio::test]
async fn failed_run_records_error_kind_and_trace() {
    let harness = Harness::new();
    let recorder = harness.recorder();

    let err = recorder
        .track(
            Algorithm::current("tests.fetch"),
            vec![RunValue::typed("video_uri", "https://video.example.gov/b.mp4")],
            |_run| async move { Err::<(), _>(TestError::Upstream("503 from origin".to_string())) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TestError::Upstream(_)));

    let runs = harness.runs_of("tests.fetch").await;
    assert_eq!(runs.len(), 1);

    let outputs = harness.outputs_of(&runs[0].id).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].data.io_type, "TestError::Upstream");
    assert_eq!(
        outputs[0].data.value,
        FieldValue::from("upstream failed: 503 from origin")
    );

    let files = harness.output_files_of(&runs[0].id).await;
    assert_eq!(files.len(), 1);
    let trace = harness.store.get::<File>(&files[0].data.file_id).await.unwrap();
    assert!(trace.data.filename.starts_with("exception_log_"));
    assert!(trace.data.uri.ends_with(".err"));

    // The local trace file is removed once promoted.
    let mut leftovers = tokio::fs::read_dir(harness.scratch()).await.unwrap();
    while let Some(entry) = leftovers.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(!name.starts_with("exception_log_"), "left behind {name}");
    }
}

#[tokio::test]
async fn panicking_body_still_closes_the_run() {
    let harness = Harness::new();
    let recorder = harness.recorder();

    let err = recorder
        .track(Algorithm::current("tests.panics"), Vec::new(), |_run| async move {
            if harness_is_broken() {
                panic!("kaboom");
            }
            Ok::<(), TestError>(())
        })
        .await
        .unwrap_err();

    match err {
        TestError::Panicked(message) => assert!(message.contains("kaboom")),
        other => panic!("expected a panic failure, got {other:?}"),
    }

    let runs = harness.runs_of("tests.panics").await;
    assert_eq!(runs.len(), 1);
    let outputs = harness.outputs_of(&runs[0].id).await;
    assert!(outputs
        .iter()
        .any(|o| o.data.io_type == "TestError::Panicked"));
}

fn harness_is_broken() -> bool {
    true
}

#[tokio::test]
async fn identical_artifacts_share_one_file_record() {
    let harness = Harness::new();
    let recorder = harness.recorder();

    let first = harness.dir.path().join("first.out");
    let second = harness.dir.path().join("second.out");
    tokio::fs::write(&first, b"ffmpeg version 6.1").await.unwrap();
    tokio::fs::write(&second, b"ffmpeg version 6.1").await.unwrap();

    for path in [first, second] {
        recorder
            .track(Algorithm::current("tests.extract"), Vec::new(), |run| async move {
                run.register_output(RunValue::Artifact(path)).await?;
                Ok::<_, TestError>(())
            })
            .await
            .unwrap();
    }

    let runs = harness.runs_of("tests.extract").await;
    assert_eq!(runs.len(), 2);
    let a = harness.output_files_of(&runs[0].id).await;
    let b = harness.output_files_of(&runs[1].id).await;
    assert_eq!(a[0].data.file_id, b[0].data.file_id);
    assert_eq!(harness.count("file").await, 1);
    assert_eq!(harness.count("algorithm").await, 1);
}

#[tokio::test]
async fn finishing_twice_is_an_error() {
    let harness = Harness::new();
    let run = harness.recorder().begin(Algorithm::current("tests.manual"));
    run.register_input(RunValue::typed("workers", 2usize))
        .await
        .unwrap();

    let record = run.finish().await.unwrap();
    assert_eq!(harness.inputs_of(&record.id).await.len(), 1);
    assert!(run.finish().await.is_err());
}

#[tokio::test]
async fn read_only_store_fails_the_run() {
    let harness = Harness::new();
    let store = councilflow::UpsertStore::new(std::sync::Arc::new(harness.documents.read_only()));
    let recorder = councilflow::RunRecorder::new(store, harness.blob_store(), harness.scratch());

    let err = recorder
        .track(Algorithm::current("tests.readonly"), Vec::new(), |_run| async move {
            Ok::<_, TestError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TestError::Store(StoreError::MissingCredentials { .. })
    ));
    assert_eq!(harness.count("run").await, 0);
}
