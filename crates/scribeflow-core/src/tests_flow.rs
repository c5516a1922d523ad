//! End-to-end flow tests
//!
//! Exercises the full pipeline (optimistic mutation, polling,
//! normalization, reconciliation, delayed invalidation) against the
//! scripted mock backend, with delays shrunk to keep the tests fast.

use std::sync::Arc;
use std::time::Duration;

use crate::api::{CreatedFile, JobAction, MockBackend, SplitBatchResponse, TranscriptionBackend};
use crate::engine::{EngineConfig, SyncEngine};
use crate::events::{EngineEvent, ViewKind};
use crate::jobs::{JobStatus, RawJobRecord};

fn flow_config() -> EngineConfig {
    EngineConfig {
        base_poll_period: Duration::from_millis(10),
        stall_window: Duration::from_secs(120),
        chunk_select_debounce: Duration::from_millis(20),
        file_list_settle: Duration::from_millis(20),
        view_invalidate_delay: Duration::from_millis(150),
        banner_clear_delay: Duration::from_millis(200),
        batch_teardown_grace: Duration::from_millis(200),
    }
}

fn flow_engine() -> (Arc<MockBackend>, SyncEngine) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let backend = Arc::new(MockBackend::new());
    let engine = SyncEngine::new(
        Arc::clone(&backend) as Arc<dyn TranscriptionBackend>,
        flow_config(),
    );
    (backend, engine)
}

/// Waits until the job reaches `status` or the deadline passes.
async fn wait_for_status(engine: &SyncEngine, job_id: i64, status: JobStatus) -> bool {
    for _ in 0..100 {
        if engine.store().job(job_id).map(|j| j.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_start_to_completion_flow() {
    let (backend, engine) = flow_engine();

    // Job 42 sits pending from the file list
    engine.ingest(vec![RawJobRecord::new(42, "pending", 0.0)]);

    // Script the backend's view of the started job. The middle record
    // uses the legacy stage-in-error-message encoding.
    backend.push_status(42, RawJobRecord::new(42, "processing", 0.0));
    let mut transcribing = RawJobRecord::new(42, "processing", 45.0);
    transcribing.error_message = Some("Stage: transcribing".to_string());
    backend.push_status(42, transcribing);
    backend.push_status(42, RawJobRecord::new(42, "completed", 100.0));

    // User hits start: the cache flips immediately, before any poll
    engine.apply(JobAction::Start, 42, None).await.unwrap();
    let job = engine.store().job(42).unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.progress, 0.0);

    engine.watch(42);
    assert!(wait_for_status(&engine, 42, JobStatus::Completed).await);

    let job = engine.store().job(42).unwrap();
    assert_eq!(job.progress, 1.0);

    // A transcript fetched around the completion instant survives it and
    // only invalidates after the settling delay, not immediately
    engine
        .store()
        .put_view(42, ViewKind::Segments, serde_json::json!([{"text": "hello"}]));
    assert!(!engine.store().view(42, ViewKind::Segments).unwrap().is_stale());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(engine.store().view(42, ViewKind::Segments).unwrap().is_stale());

    engine.shutdown();
}

#[tokio::test]
async fn test_mid_flow_stage_decoding() {
    let (backend, engine) = flow_engine();

    backend.push_status(7, RawJobRecord::new(7, "processing", 0.1));
    let mut record = RawJobRecord::new(7, "processing", 30.0);
    record.error_message = Some("Stage: extracting audio".to_string());
    backend.push_status(7, record);

    engine.watch(7);
    for _ in 0..100 {
        let job = engine.store().job(7);
        if job.as_ref().and_then(|j| j.stage.clone()).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let job = engine.store().job(7).unwrap();
    assert_eq!(job.stage.as_deref(), Some("extracting audio"));
    assert!(job.error_message.is_none());
    assert_eq!(job.progress, 0.3);

    engine.shutdown();
}

#[tokio::test]
async fn test_split_batch_flow_to_partial_completion() {
    let (backend, mut engine) = flow_engine();
    let mut rx = engine.take_event_receiver().unwrap();

    backend.set_split_response(SplitBatchResponse {
        parent_file_id: 100,
        created_files: vec![
            CreatedFile {
                file_id: 101,
                original_filename: "interview-part1.mp3".to_string(),
                order_index: 0,
                split_start_seconds: Some(0.0),
                split_end_seconds: Some(1800.0),
            },
            CreatedFile {
                file_id: 102,
                original_filename: "interview-part2.mp3".to_string(),
                order_index: 1,
                split_start_seconds: Some(1800.0),
                split_end_seconds: None,
            },
        ],
    });

    // Chunk 101 succeeds; chunk 102 fails
    backend.push_status(101, RawJobRecord::new(101, "processing", 0.5));
    backend.push_status(101, RawJobRecord::new(101, "completed", 1.0));
    backend.push_status(102, RawJobRecord::new(102, "processing", 0.2));
    backend.push_status(102, RawJobRecord::new(102, "failed", 0.2));

    let progress = engine.split(100).await.unwrap();
    assert_eq!(progress.total, 2);
    assert!(!progress.is_complete);

    // Both chunks settle
    assert!(wait_for_status(&engine, 101, JobStatus::Completed).await);
    assert!(wait_for_status(&engine, 102, JobStatus::Failed).await);

    let progress = engine.batch_progress().unwrap();
    assert!(progress.is_complete);
    assert_eq!(progress.completed_count, 1);
    assert_eq!(progress.failed_count, 1);
    assert_eq!(progress.progress, 1.0);

    // Partial failure reports distinctly: completed with failures
    let mut saw_completion = false;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::BatchCompleted {
            parent_id,
            completed,
            failed,
        } = event
        {
            saw_completion = true;
            assert_eq!(parent_id, 100);
            assert_eq!(completed, 1);
            assert_eq!(failed, 1);
        }
    }
    assert!(saw_completion);

    // Teardown after the grace window
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(engine.active_batch().is_none());

    engine.shutdown();
}

#[tokio::test]
async fn test_failed_start_rolls_back_and_next_poll_recovers() {
    let (backend, engine) = flow_engine();

    engine.ingest(vec![RawJobRecord::new(42, "pending", 0.0)]);
    let before = engine.store().job(42).unwrap();

    backend.fail_next_action(crate::EngineError::Transient("gateway timeout".to_string()));
    let result = engine.apply(JobAction::Start, 42, None).await;
    assert!(result.is_err());

    // Cache identical to the pre-mutation snapshot
    assert_eq!(engine.store().job(42).unwrap(), before);

    // A later poll converges to whatever the server says
    backend.push_status(42, RawJobRecord::new(42, "pending", 0.0));
    engine.watch(42);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.store().job(42).unwrap().status, JobStatus::Pending);

    engine.shutdown();
}
