//! Read-only status projection over an instance's history.
//!
//! Queries never disturb a running instance: the projection folds a snapshot
//! of the history and tolerates seeing an instance mid-step.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CompletionOutcome, Event, RuntimeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    Running,
    Completed,
    Failed,
}

/// Per-activity progress entry derived by folding the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStatusEntry {
    pub name: String,
    pub status: ActivityState,
    pub scheduled_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Queryable snapshot of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub runtime_status: RuntimeStatus,
    pub created_time: Option<DateTime<Utc>>,
    pub last_updated_time: Option<DateTime<Utc>>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    /// Keyed by activity name; `None` when the history holds no task events,
    /// in which case `message` carries a generic status line instead.
    pub activities: Option<BTreeMap<String, ActivityStatusEntry>>,
    pub message: Option<String>,
}

/// Derive the lifecycle status from history. Pending covers the window
/// between the start request and the first execution step (the instance has
/// neither scheduled work nor published a custom status yet).
pub fn runtime_status_of(history: &[Event], has_custom_status: bool) -> RuntimeStatus {
    for event in history.iter().rev() {
        if let Event::ExecutionCompleted { outcome, .. } = event {
            return match outcome {
                CompletionOutcome::Completed { .. } => RuntimeStatus::Completed,
                CompletionOutcome::Failed { .. } => RuntimeStatus::Failed,
                CompletionOutcome::Terminated { .. } => RuntimeStatus::Terminated,
            };
        }
    }
    let only_started = history
        .iter()
        .all(|e| matches!(e, Event::OrchestratorStarted { .. }));
    if only_started && !has_custom_status {
        RuntimeStatus::Pending
    } else {
        RuntimeStatus::Running
    }
}

fn generic_message(status: RuntimeStatus) -> &'static str {
    match status {
        RuntimeStatus::Pending => "The orchestration is waiting to start.",
        RuntimeStatus::Running => "The orchestration is currently running.",
        RuntimeStatus::Completed => "The orchestration has completed.",
        RuntimeStatus::Failed => "The orchestration failed.",
        RuntimeStatus::Terminated => "The orchestration was terminated.",
    }
}

/// Build the queryable snapshot from a history snapshot and the live
/// custom-status record.
pub fn project(
    instance: &str,
    history: &[Event],
    custom_status: Option<String>,
) -> InstanceSnapshot {
    let runtime_status = runtime_status_of(history, custom_status.is_some());

    let mut created_time = None;
    let mut input = None;
    let mut output = None;
    // scheduled_event_id -> activity name, to resolve terminal events.
    let mut scheduled_names: HashMap<u64, String> = HashMap::new();
    let mut activities: BTreeMap<String, ActivityStatusEntry> = BTreeMap::new();

    for event in history {
        match event {
            Event::OrchestratorStarted { timestamp, input: i, .. } => {
                created_time = Some(*timestamp);
                input = Some(i.clone());
            }
            Event::TaskScheduled { event_id, timestamp, name, .. } => {
                scheduled_names.insert(*event_id, name.clone());
                activities.insert(
                    name.clone(),
                    ActivityStatusEntry {
                        name: name.clone(),
                        status: ActivityState::Running,
                        scheduled_at: *timestamp,
                        finished_at: None,
                        duration_ms: None,
                        result: None,
                        error: None,
                    },
                );
            }
            Event::TaskCompleted { timestamp, scheduled_event_id, result, .. } => {
                let Some(name) = scheduled_names.get(scheduled_event_id) else {
                    continue;
                };
                if let Some(entry) = activities.get_mut(name) {
                    entry.status = ActivityState::Completed;
                    entry.finished_at = Some(*timestamp);
                    entry.duration_ms =
                        Some((*timestamp - entry.scheduled_at).num_milliseconds());
                    entry.result = Some(result.clone());
                }
            }
            Event::TaskFailed { timestamp, scheduled_event_id, reason, .. } => {
                let Some(name) = scheduled_names.get(scheduled_event_id) else {
                    continue;
                };
                if let Some(entry) = activities.get_mut(name) {
                    entry.status = ActivityState::Failed;
                    entry.finished_at = Some(*timestamp);
                    entry.duration_ms =
                        Some((*timestamp - entry.scheduled_at).num_milliseconds());
                    entry.error = Some(reason.clone());
                }
            }
            Event::ExecutionCompleted { outcome, .. } => {
                output = match outcome {
                    CompletionOutcome::Completed { output } => Some(output.clone()),
                    CompletionOutcome::Failed { error } => Some(error.clone()),
                    CompletionOutcome::Terminated { reason } => Some(reason.clone()),
                };
            }
            Event::EventRaised { .. } => {}
        }
    }

    let last_updated_time = history.last().map(|e| e.timestamp());
    let (activities, message) = if activities.is_empty() {
        (None, Some(generic_message(runtime_status).to_string()))
    } else {
        (Some(activities), None)
    };

    InstanceSnapshot {
        instance_id: instance.to_string(),
        runtime_status,
        created_time,
        last_updated_time,
        input,
        output,
        custom_status,
        activities,
        message,
    }
}
