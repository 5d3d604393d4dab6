//! Durable workflow engine for the travel-recommendation pipeline.
//!
//! The engine drives deterministic orchestration code over an append-only
//! per-instance event history. On every resumption the orchestration is
//! re-executed from the top; steps whose results already exist in history
//! resolve immediately from the recorded events, and execution suspends at
//! the first step with no recorded result. Activities run out of line via the
//! runtime's worker and report back as `TaskCompleted`/`TaskFailed` events;
//! human approval arrives as an `EventRaised` signal.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::task::Poll;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod futures;
pub mod pipeline;
pub mod providers;
pub mod runtime;

pub use crate::futures::{ActivityFuture, ExternalEventFuture};
pub use error::{WaitError, WorkflowError};

/// Terminal outcome carried by the `ExecutionCompleted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CompletionOutcome {
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

/// One immutable record in an instance's history.
///
/// `event_id` is assigned by the history store (strictly increasing per
/// instance, starting at 1); the value set by constructors is a placeholder.
/// `TaskCompleted`/`TaskFailed` reference their `TaskScheduled` through
/// `scheduled_event_id`; a scheduled task has at most one terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Event {
    OrchestratorStarted {
        event_id: u64,
        timestamp: DateTime<Utc>,
        name: String,
        input: String,
    },
    TaskScheduled {
        event_id: u64,
        timestamp: DateTime<Utc>,
        name: String,
        input: String,
    },
    TaskCompleted {
        event_id: u64,
        timestamp: DateTime<Utc>,
        scheduled_event_id: u64,
        result: String,
    },
    TaskFailed {
        event_id: u64,
        timestamp: DateTime<Utc>,
        scheduled_event_id: u64,
        reason: String,
    },
    EventRaised {
        event_id: u64,
        timestamp: DateTime<Utc>,
        name: String,
        payload: String,
    },
    ExecutionCompleted {
        event_id: u64,
        timestamp: DateTime<Utc>,
        outcome: CompletionOutcome,
    },
}

impl Event {
    pub fn orchestrator_started(name: impl Into<String>, input: impl Into<String>) -> Self {
        Event::OrchestratorStarted {
            event_id: 0,
            timestamp: Utc::now(),
            name: name.into(),
            input: input.into(),
        }
    }

    pub fn task_scheduled(name: impl Into<String>, input: impl Into<String>) -> Self {
        Event::TaskScheduled {
            event_id: 0,
            timestamp: Utc::now(),
            name: name.into(),
            input: input.into(),
        }
    }

    pub fn task_completed(scheduled_event_id: u64, result: impl Into<String>) -> Self {
        Event::TaskCompleted {
            event_id: 0,
            timestamp: Utc::now(),
            scheduled_event_id,
            result: result.into(),
        }
    }

    pub fn task_failed(scheduled_event_id: u64, reason: impl Into<String>) -> Self {
        Event::TaskFailed {
            event_id: 0,
            timestamp: Utc::now(),
            scheduled_event_id,
            reason: reason.into(),
        }
    }

    pub fn event_raised(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Event::EventRaised {
            event_id: 0,
            timestamp: Utc::now(),
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn execution_completed(outcome: CompletionOutcome) -> Self {
        Event::ExecutionCompleted {
            event_id: 0,
            timestamp: Utc::now(),
            outcome,
        }
    }

    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestratorStarted { event_id, .. }
            | Event::TaskScheduled { event_id, .. }
            | Event::TaskCompleted { event_id, .. }
            | Event::TaskFailed { event_id, .. }
            | Event::EventRaised { event_id, .. }
            | Event::ExecutionCompleted { event_id, .. } => *event_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::OrchestratorStarted { timestamp, .. }
            | Event::TaskScheduled { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::EventRaised { timestamp, .. }
            | Event::ExecutionCompleted { timestamp, .. } => *timestamp,
        }
    }

    pub fn with_event_id(mut self, id: u64) -> Self {
        match &mut self {
            Event::OrchestratorStarted { event_id, .. }
            | Event::TaskScheduled { event_id, .. }
            | Event::TaskCompleted { event_id, .. }
            | Event::TaskFailed { event_id, .. }
            | Event::EventRaised { event_id, .. }
            | Event::ExecutionCompleted { event_id, .. } => *event_id = id,
        }
        self
    }
}

/// Instance lifecycle status, derived entirely from history plus the
/// presence of a custom-status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl RuntimeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated
        )
    }
}

/// Decisions recorded by orchestration code during a turn. The engine
/// materializes these as history events and dispatched work; the replay core
/// itself has no side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity { name: String, input: String },
    WaitExternal { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) history: Vec<Event>,
    /// `TaskScheduled` event ids already matched to a step this turn.
    pub(crate) claimed_schedules: HashSet<u64>,
    /// `EventRaised` event ids already consumed by a wait this turn.
    pub(crate) claimed_signals: HashSet<u64>,
    pub(crate) actions: Vec<Action>,
    pub(crate) logs: Vec<(LogLevel, String)>,
    /// Outer `None` = untouched this turn; `Some(None)` = cleared.
    pub(crate) custom_status: Option<Option<String>>,
    pub(crate) nondeterminism: Option<String>,
}

/// Handle given to orchestration code. All interaction with the outside
/// world goes through here; the code itself must stay deterministic (no
/// clocks, randomness, or I/O outside activity calls).
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub fn new(instance: impl Into<String>, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner {
                instance: instance.into(),
                history,
                claimed_schedules: HashSet::new(),
                claimed_signals: HashSet::new(),
                actions: Vec::new(),
                logs: Vec::new(),
                custom_status: None,
                nondeterminism: None,
            })),
        }
    }

    /// Schedule (or, during replay, resolve) an activity call. The returned
    /// future yields the recorded `Ok(result)` or `Err(reason)`.
    pub fn call_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> ActivityFuture {
        ActivityFuture::new(self.clone(), name.into(), input.into())
    }

    /// Wait for a named external signal. Signals already raised resolve
    /// immediately; each signal occurrence is consumed by at most one wait.
    pub fn wait_for_event(&self, name: impl Into<String>) -> ExternalEventFuture {
        ExternalEventFuture::new(self.clone(), name.into())
    }

    /// Overwrite the instance's custom-status record. Fire-and-forget,
    /// last write wins; republishing the same value during replay is fine.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.inner.lock().unwrap().custom_status = Some(Some(status.into()));
    }

    pub fn clear_custom_status(&self) {
        self.inner.lock().unwrap().custom_status = Some(None);
    }

    pub fn instance_id(&self) -> String {
        self.inner.lock().unwrap().instance.clone()
    }

    /// Timestamp of `OrchestratorStarted`. Deterministic across replays, so
    /// safe to use inside orchestration code where a wall clock is not.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap();
        inner.history.iter().find_map(|e| match e {
            Event::OrchestratorStarted { timestamp, .. } => Some(*timestamp),
            _ => None,
        })
    }

    pub fn trace_info(&self, msg: impl Into<String>) {
        self.inner.lock().unwrap().logs.push((LogLevel::Info, msg.into()));
    }

    pub fn trace_warn(&self, msg: impl Into<String>) {
        self.inner.lock().unwrap().logs.push((LogLevel::Warn, msg.into()));
    }

    pub fn trace_error(&self, msg: impl Into<String>) {
        self.inner.lock().unwrap().logs.push((LogLevel::Error, msg.into()));
    }
}

/// Result of replaying one turn of an orchestration against its history.
#[derive(Debug)]
pub struct TurnResult {
    /// New decisions with no counterpart in history yet.
    pub actions: Vec<Action>,
    /// Trace lines recorded by the orchestration, from the top. Replay
    /// re-records the same prefix each turn; the engine emits only the tail.
    pub logs: Vec<(LogLevel, String)>,
    /// Latest custom-status write of the turn, if any.
    pub custom_status: Option<Option<String>>,
    /// Set when replay observed a history/code mismatch.
    pub nondeterminism: Option<String>,
    /// `Some` when the orchestration ran to completion.
    pub output: Option<Result<String, String>>,
}

/// Replay one turn: re-execute the orchestration from the beginning against
/// the given history, stopping at the first step whose result is not yet
/// recorded. Pure apart from what the orchestration writes into the context.
pub fn run_turn<F, Fut>(
    instance: &str,
    history: Vec<Event>,
    input: String,
    orchestrator: F,
) -> TurnResult
where
    F: Fn(OrchestrationContext, String) -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance, history);
    let fut = orchestrator(ctx.clone(), input);
    let mut fut = std::pin::pin!(fut);

    let waker = ::futures::task::noop_waker();
    let mut task_cx = std::task::Context::from_waker(&waker);

    // A single poll drives execution through every step that resolves from
    // history; the first unresolved step suspends the whole future.
    let output = match fut.as_mut().poll(&mut task_cx) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };

    let mut inner = ctx.inner.lock().unwrap();
    TurnResult {
        actions: std::mem::take(&mut inner.actions),
        logs: std::mem::take(&mut inner.logs),
        custom_status: inner.custom_status.take(),
        nondeterminism: inner.nondeterminism.take(),
        output,
    }
}
