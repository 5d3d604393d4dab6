#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use tripflow::pipeline;
use tripflow::providers::in_memory::InMemoryHistoryStore;
use tripflow::providers::HistoryStore;
use tripflow::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use tripflow::runtime::Runtime;
use tripflow::Event;

/// Invocation counters and captured inputs for the stub pipeline activities.
#[derive(Default)]
pub struct StubCounters {
    pub recommend: AtomicUsize,
    pub search: AtomicUsize,
    pub aggregate: AtomicUsize,
    pub save: AtomicUsize,
    pub last_save_input: Mutex<Option<String>>,
}

#[derive(Default, Clone, Copy)]
pub struct StubConfig {
    pub fail_recommend: bool,
    pub fail_search: bool,
    pub fail_save: bool,
}

/// Stub implementations of the four pipeline activities. Real deployments
/// wire a model call, a listing-search tool, and a blob upload here.
pub fn stub_activities(counters: Arc<StubCounters>, config: StubConfig) -> ActivityRegistry {
    let rec = counters.clone();
    let sea = counters.clone();
    let agg = counters.clone();
    let sav = counters;
    ActivityRegistry::builder()
        .register_result(pipeline::RECOMMEND_ACTIVITY, move |input: String| {
            let counters = rec.clone();
            async move {
                counters.recommend.fetch_add(1, Ordering::SeqCst);
                if config.fail_recommend {
                    Err("model endpoint unreachable".to_string())
                } else {
                    Ok(format!(r#"{{"location":"Kyoto","source":{input}}}"#))
                }
            }
        })
        .register_result(pipeline::SEARCH_ACTIVITY, move |input: String| {
            let counters = sea.clone();
            async move {
                counters.search.fetch_add(1, Ordering::SeqCst);
                if config.fail_search {
                    Err("listing search failed".to_string())
                } else {
                    Ok(format!(r#"{{"listings":["l1","l2"],"query":{input}}}"#))
                }
            }
        })
        .register_result(pipeline::AGGREGATE_ACTIVITY, move |_input: String| {
            let counters = agg.clone();
            async move {
                counters.aggregate.fetch_add(1, Ordering::SeqCst);
                Ok("two listings in Kyoto fit the budget".to_string())
            }
        })
        .register_result(pipeline::SAVE_ACTIVITY, move |input: String| {
            let counters = sav.clone();
            async move {
                counters.save.fetch_add(1, Ordering::SeqCst);
                *counters.last_save_input.lock().await = Some(input);
                if config.fail_save {
                    Err("upload failed".to_string())
                } else {
                    Ok(r#"{"status":"success"}"#.to_string())
                }
            }
        })
        .build()
}

pub fn pipeline_orchestrations() -> OrchestrationRegistry {
    pipeline::register(OrchestrationRegistry::builder()).build()
}

/// Runtime over an in-memory store with stub pipeline activities.
pub async fn pipeline_runtime(
    config: StubConfig,
) -> (Arc<Runtime>, Arc<InMemoryHistoryStore>, Arc<StubCounters>) {
    let store = Arc::new(InMemoryHistoryStore::new());
    let counters = Arc::new(StubCounters::default());
    let rt = Runtime::start_with_store(
        store.clone(),
        stub_activities(counters.clone(), config),
        pipeline_orchestrations(),
    )
    .await;
    (rt, store, counters)
}

pub fn valid_request() -> String {
    r#"{
        "destination": "Japan",
        "travel_dates": { "start": "2023-10-01", "end": "2023-10-05" },
        "days": 5,
        "budget_per_day": 1000
    }"#
    .to_string()
}

/// Poll until the instance's custom status reaches the given pipeline stage.
pub async fn wait_for_stage(rt: &Arc<Runtime>, instance: &str, stage: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(snapshot) = rt.get_status(instance).await {
            if let Some(raw) = &snapshot.custom_status {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
                    if value["stage"] == stage {
                        return;
                    }
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for stage {stage} on {instance}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until a predicate over the history holds.
pub async fn wait_for_history(
    store: &dyn HistoryStore,
    instance: &str,
    timeout: Duration,
    predicate: impl Fn(&[Event]) -> bool,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(history) = store.read_all(instance).await {
            if predicate(&history) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on history predicate for {instance}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn approval_payload(status: &str) -> String {
    format!(r#"{{"status":"{status}"}}"#)
}
