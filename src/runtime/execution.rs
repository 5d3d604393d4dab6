//! Per-instance engine loop.
//!
//! Each live instance owns one cooperative loop: replay a turn against the
//! persisted history, materialize new decisions as events and dispatched
//! work, then suspend on the instance inbox until a completion or signal
//! arrives. Suspension holds no thread; the loop is a parked tokio task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::activity::ActivityWorkItem;
use super::registry::OrchestrationHandler;
use super::router::OrchestratorMsg;
use super::Runtime;
use crate::providers::StoreError;
use crate::{run_turn, CompletionOutcome, Event, LogLevel};

const APPEND_MAX_ATTEMPTS: u32 = 5;

/// Append with bounded exponential backoff on transient store errors.
/// `NotFound`/`AlreadyExists` are not retried; they indicate a bug or a
/// deleted instance and end the loop.
async fn append_with_retry(
    rt: &Runtime,
    instance: &str,
    event: Event,
) -> Result<u64, StoreError> {
    let mut attempts: u32 = 0;
    loop {
        match rt.store.append(instance, event.clone()).await {
            Ok(id) => return Ok(id),
            Err(StoreError::Unavailable(msg)) if attempts < APPEND_MAX_ATTEMPTS => {
                let backoff_ms = 10u64.saturating_mul(1 << attempts);
                warn!(instance = %instance, attempts, backoff_ms, error = %msg, "append failed; retrying");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn emit_trace(instance: &str, lines: &[(LogLevel, String)], emitted: &mut usize) {
    for (level, line) in lines.iter().skip(*emitted) {
        match level {
            LogLevel::Info => info!(instance = %instance, "{line}"),
            LogLevel::Warn => warn!(instance = %instance, "{line}"),
            LogLevel::Error => error!(instance = %instance, "{line}"),
        }
    }
    if lines.len() > *emitted {
        *emitted = lines.len();
    }
}

/// Scheduled tasks with no terminal event yet: `(scheduled_event_id, name, input)`.
fn unresolved_schedules(history: &[Event]) -> Vec<(u64, String, String)> {
    let mut scheduled: HashMap<u64, (String, String)> = HashMap::new();
    for event in history {
        match event {
            Event::TaskScheduled { event_id, name, input, .. } => {
                scheduled.insert(*event_id, (name.clone(), input.clone()));
            }
            Event::TaskCompleted { scheduled_event_id, .. }
            | Event::TaskFailed { scheduled_event_id, .. } => {
                scheduled.remove(scheduled_event_id);
            }
            _ => {}
        }
    }
    let mut out: Vec<_> = scheduled
        .into_iter()
        .map(|(id, (name, input))| (id, name, input))
        .collect();
    out.sort_by_key(|(id, ..)| *id);
    out
}

/// Apply one inbox message to the history. Returns `Some(reason)` when the
/// message was a terminate request.
async fn apply_message(
    rt: &Runtime,
    instance: &str,
    msg: OrchestratorMsg,
    in_flight: &mut HashSet<u64>,
) -> Result<Option<String>, StoreError> {
    match msg {
        OrchestratorMsg::ActivityCompleted { scheduled_event_id, result } => {
            in_flight.remove(&scheduled_event_id);
            append_with_retry(rt, instance, Event::task_completed(scheduled_event_id, result))
                .await?;
        }
        OrchestratorMsg::ActivityFailed { scheduled_event_id, reason } => {
            in_flight.remove(&scheduled_event_id);
            append_with_retry(rt, instance, Event::task_failed(scheduled_event_id, reason))
                .await?;
        }
        OrchestratorMsg::ExternalRaised { name, payload } => {
            append_with_retry(rt, instance, Event::event_raised(name, payload)).await?;
        }
        OrchestratorMsg::Terminate { reason } => return Ok(Some(reason)),
        // The history already changed; the next turn picks it up.
        OrchestratorMsg::Nudge => {}
    }
    Ok(None)
}

/// Drive one instance until it reaches a terminal status or the runtime
/// shuts down. Only one loop may run per instance; the runtime enforces
/// that by keying inbox registration on the instance id.
pub(crate) async fn run_instance(
    rt: Arc<Runtime>,
    instance: String,
    handler: Arc<dyn OrchestrationHandler>,
    mut inbox: mpsc::UnboundedReceiver<OrchestratorMsg>,
) {
    // Activities this loop has already handed to the worker. Empty after a
    // restart, so still-unresolved scheduled work is dispatched again.
    let mut in_flight: HashSet<u64> = HashSet::new();
    let mut emitted_logs = 0usize;
    let mut published_status: Option<Option<String>> = None;

    'outer: loop {
        let history = match rt.store.read_all(&instance).await {
            Ok(h) => h,
            Err(StoreError::Unavailable(msg)) => {
                warn!(instance = %instance, error = %msg, "history read failed; retrying");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }
            Err(e) => {
                error!(instance = %instance, error = %e, "history read failed; stopping engine loop");
                break;
            }
        };

        let input = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestratorStarted { input, .. } => Some(input.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let turn = run_turn(&instance, history.clone(), input, |ctx, input| {
            let handler = handler.clone();
            async move { handler.invoke(ctx, input).await }
        });

        emit_trace(&instance, &turn.logs, &mut emitted_logs);

        // Custom status is fire-and-forget; replay republishes the same
        // value, so only changes hit the store.
        if let Some(update) = turn.custom_status {
            if published_status.as_ref() != Some(&update) {
                if let Err(e) = rt.store.set_custom_status(&instance, update.clone()).await {
                    warn!(instance = %instance, error = %e, "custom status publish failed");
                }
                published_status = Some(update);
            }
        }

        if let Some(mismatch) = turn.nondeterminism {
            error!(instance = %instance, "{mismatch}");
            let outcome = CompletionOutcome::Failed {
                error: format!("nondeterministic execution: {mismatch}"),
            };
            let _ = append_with_retry(&rt, &instance, Event::execution_completed(outcome)).await;
            break;
        }

        if let Some(result) = turn.output {
            let outcome = match result {
                Ok(output) => CompletionOutcome::Completed { output },
                Err(error) => CompletionOutcome::Failed { error },
            };
            match append_with_retry(&rt, &instance, Event::execution_completed(outcome)).await {
                Ok(_) => debug!(instance = %instance, "instance reached terminal status"),
                Err(e) => error!(instance = %instance, error = %e, "failed to record terminal event"),
            }
            break;
        }

        // Materialize new schedule decisions. WaitExternal needs no event:
        // the wait is implied by replay and satisfied by a future
        // EventRaised append.
        for action in &turn.actions {
            if let crate::Action::CallActivity { name, input } = action {
                if let Err(e) = append_with_retry(
                    &rt,
                    &instance,
                    Event::task_scheduled(name.clone(), input.clone()),
                )
                .await
                {
                    error!(instance = %instance, error = %e, "failed to persist TaskScheduled; stopping");
                    break 'outer;
                }
            }
        }

        // Dispatch every scheduled-but-unresolved task this loop does not
        // already have in flight.
        let history = match rt.store.read_all(&instance).await {
            Ok(h) => h,
            Err(e) => {
                error!(instance = %instance, error = %e, "history re-read failed; stopping engine loop");
                break;
            }
        };
        for (scheduled_event_id, name, input) in unresolved_schedules(&history) {
            if in_flight.insert(scheduled_event_id) {
                debug!(
                    instance = %instance,
                    activity = %name,
                    scheduled_event_id,
                    "dispatching activity"
                );
                if rt
                    .worker_tx
                    .send(ActivityWorkItem {
                        instance: instance.clone(),
                        scheduled_event_id,
                        name,
                        input,
                    })
                    .is_err()
                {
                    // Runtime shutting down.
                    break 'outer;
                }
            }
        }

        // Suspend until something new arrives, then drain whatever else is
        // already queued before replaying once for the whole batch.
        let Some(msg) = inbox.recv().await else {
            break;
        };
        let mut terminate_reason = match apply_message(&rt, &instance, msg, &mut in_flight).await {
            Ok(r) => r,
            Err(e) => {
                error!(instance = %instance, error = %e, "failed to persist completion; stopping");
                break;
            }
        };
        while terminate_reason.is_none() {
            match inbox.try_recv() {
                Ok(msg) => {
                    terminate_reason =
                        match apply_message(&rt, &instance, msg, &mut in_flight).await {
                            Ok(r) => r,
                            Err(e) => {
                                error!(instance = %instance, error = %e, "failed to persist completion; stopping");
                                break 'outer;
                            }
                        };
                }
                Err(_) => break,
            }
        }

        if let Some(reason) = terminate_reason {
            info!(instance = %instance, reason = %reason, "terminating instance");
            let outcome = CompletionOutcome::Terminated { reason };
            let _ = append_with_retry(&rt, &instance, Event::execution_completed(outcome)).await;
            break;
        }
    }

    rt.router.unregister(&instance).await;
}
