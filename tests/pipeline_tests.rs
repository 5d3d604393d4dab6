// End-to-end tests for the travel-recommendation pipeline: staged
// progression, approval decisions, per-stage failure handling, and start
// validation.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    approval_payload, pipeline_runtime, valid_request, wait_for_stage, StubConfig,
};
use tripflow::pipeline::{self, SaveRequest};
use tripflow::providers::HistoryStore;
use tripflow::{RuntimeStatus, WorkflowError};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn approved_pipeline_saves_with_approve_tag() {
    let (rt, _store, counters) = pipeline_runtime(StubConfig::default()).await;
    pipeline::start(&rt, "trip-approve", &valid_request()).await.unwrap();

    wait_for_stage(&rt, "trip-approve", "await-approval", TIMEOUT).await;
    rt.raise_event("trip-approve", pipeline::APPROVAL_EVENT, approval_payload("approve"))
        .await
        .unwrap();

    let output = pipeline::wait_for_output(&rt, "trip-approve", TIMEOUT).await.unwrap();
    assert!(output.success);
    assert_eq!(output.decision.as_deref(), Some("approve"));
    assert_eq!(output.summary.as_deref(), Some("two listings in Kyoto fit the budget"));

    assert_eq!(counters.save.load(Ordering::SeqCst), 1);
    let save_input = counters.last_save_input.lock().await.clone().unwrap();
    let save: SaveRequest = serde_json::from_str(&save_input).unwrap();
    assert_eq!(save.status, "approve");
    assert_eq!(save.instance_id, "trip-approve");

    rt.shutdown().await;
}

#[tokio::test]
async fn rejected_pipeline_saves_with_reject_tag() {
    let (rt, _store, counters) = pipeline_runtime(StubConfig::default()).await;
    pipeline::start(&rt, "trip-reject", &valid_request()).await.unwrap();

    wait_for_stage(&rt, "trip-reject", "await-approval", TIMEOUT).await;
    rt.raise_event("trip-reject", pipeline::APPROVAL_EVENT, approval_payload("reject"))
        .await
        .unwrap();

    let output = pipeline::wait_for_output(&rt, "trip-reject", TIMEOUT).await.unwrap();
    assert!(output.success);
    assert_eq!(output.decision.as_deref(), Some("reject"));

    let save_input = counters.last_save_input.lock().await.clone().unwrap();
    let save: SaveRequest = serde_json::from_str(&save_input).unwrap();
    assert_eq!(save.status, "reject");

    rt.shutdown().await;
}

#[tokio::test]
async fn recommend_failure_completes_normally_without_later_stages() {
    let (rt, _store, counters) = pipeline_runtime(StubConfig {
        fail_recommend: true,
        ..Default::default()
    })
    .await;
    pipeline::start(&rt, "trip-recfail", &valid_request()).await.unwrap();

    let snapshot = rt.wait_for_completion("trip-recfail", TIMEOUT).await.unwrap();
    // The workflow ended normally; the failure is data in the output.
    assert_eq!(snapshot.runtime_status, RuntimeStatus::Completed);

    let output: pipeline::PipelineOutput =
        serde_json::from_str(snapshot.output.as_deref().unwrap()).unwrap();
    assert!(!output.success);
    assert_eq!(output.stage, "recommend");
    assert_eq!(output.error.as_deref(), Some("model endpoint unreachable"));

    assert_eq!(counters.recommend.load(Ordering::SeqCst), 1);
    assert_eq!(counters.search.load(Ordering::SeqCst), 0);
    assert_eq!(counters.aggregate.load(Ordering::SeqCst), 0);
    assert_eq!(counters.save.load(Ordering::SeqCst), 0);

    rt.shutdown().await;
}

#[tokio::test]
async fn unrecognized_approval_status_skips_save() {
    let (rt, _store, counters) = pipeline_runtime(StubConfig::default()).await;
    pipeline::start(&rt, "trip-badstatus", &valid_request()).await.unwrap();

    wait_for_stage(&rt, "trip-badstatus", "await-approval", TIMEOUT).await;
    rt.raise_event("trip-badstatus", pipeline::APPROVAL_EVENT, approval_payload("maybe"))
        .await
        .unwrap();

    let output = pipeline::wait_for_output(&rt, "trip-badstatus", TIMEOUT).await.unwrap();
    assert!(!output.success);
    assert_eq!(output.stage, "approval");
    assert_eq!(counters.save.load(Ordering::SeqCst), 0);

    rt.shutdown().await;
}

#[tokio::test]
async fn save_failure_keeps_decision_in_output() {
    let (rt, _store, _counters) = pipeline_runtime(StubConfig {
        fail_save: true,
        ..Default::default()
    })
    .await;
    pipeline::start(&rt, "trip-savefail", &valid_request()).await.unwrap();

    wait_for_stage(&rt, "trip-savefail", "await-approval", TIMEOUT).await;
    rt.raise_event("trip-savefail", pipeline::APPROVAL_EVENT, approval_payload("approve"))
        .await
        .unwrap();

    let output = pipeline::wait_for_output(&rt, "trip-savefail", TIMEOUT).await.unwrap();
    assert!(!output.success);
    assert_eq!(output.stage, "save");
    assert_eq!(output.decision.as_deref(), Some("approve"));
    assert_eq!(output.error.as_deref(), Some("upload failed"));

    rt.shutdown().await;
}

#[tokio::test]
async fn invalid_start_input_creates_no_instance() {
    let (rt, store, _counters) = pipeline_runtime(StubConfig::default()).await;

    let err = pipeline::start(&rt, "trip-invalid", r#"{"days": 3}"#).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));
    assert!(store.list_instances().await.is_empty(), "no orphan instance");

    let err = pipeline::start(&rt, "trip-invalid", "not json").await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));
    assert!(store.list_instances().await.is_empty());

    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_instance_id_is_rejected() {
    let (rt, _store, _counters) = pipeline_runtime(StubConfig::default()).await;
    pipeline::start(&rt, "trip-dup", &valid_request()).await.unwrap();
    let err = pipeline::start(&rt, "trip-dup", &valid_request()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::AlreadyExists(_)));
    rt.shutdown().await;
}

#[tokio::test]
async fn custom_status_tracks_stages_while_running() {
    let (rt, _store, _counters) = pipeline_runtime(StubConfig::default()).await;
    pipeline::start(&rt, "trip-stages", &valid_request()).await.unwrap();

    wait_for_stage(&rt, "trip-stages", "await-approval", TIMEOUT).await;
    let snapshot = rt.get_status("trip-stages").await.unwrap();
    assert_eq!(snapshot.runtime_status, RuntimeStatus::Running);

    let status: pipeline::StageStatus =
        serde_json::from_str(snapshot.custom_status.as_deref().unwrap()).unwrap();
    assert_eq!(status.stage, "await-approval");
    assert_eq!(status.progress, 80);
    assert!(status.start_time.is_some());

    // The three completed stages are visible in the activity fold.
    let activities = snapshot.activities.unwrap();
    assert!(activities.contains_key(pipeline::RECOMMEND_ACTIVITY));
    assert!(activities.contains_key(pipeline::SEARCH_ACTIVITY));
    assert!(activities.contains_key(pipeline::AGGREGATE_ACTIVITY));
    assert!(!activities.contains_key(pipeline::SAVE_ACTIVITY));

    rt.raise_event("trip-stages", pipeline::APPROVAL_EVENT, approval_payload("approve"))
        .await
        .unwrap();
    let output = pipeline::wait_for_output(&rt, "trip-stages", TIMEOUT).await.unwrap();
    assert!(output.success);

    rt.shutdown().await;
}

#[tokio::test]
async fn start_new_generates_distinct_instance_ids() {
    let (rt, _store, _counters) = pipeline_runtime(StubConfig::default()).await;
    let a = pipeline::start_new(&rt, &valid_request()).await.unwrap();
    let b = pipeline::start_new(&rt, &valid_request()).await.unwrap();
    assert_ne!(a, b);
    rt.shutdown().await;
}
