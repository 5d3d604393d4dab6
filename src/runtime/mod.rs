//! In-process runtime: owns the history store, the registries, the
//! per-instance engine loops, and the activity worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{WaitError, WorkflowError};
use crate::providers::{HistoryStore, StoreError};
use crate::{Event, RuntimeStatus};

pub mod activity;
pub mod execution;
pub mod registry;
pub mod router;
pub mod status;

use activity::{ActivityWorkItem, ActivityWorker};
use registry::{ActivityRegistry, OrchestrationRegistry};
use router::{InstanceRouter, OrchestratorMsg};
use status::InstanceSnapshot;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The orchestrator runtime. One engine loop runs per live instance;
/// different instances execute fully in parallel and share nothing but the
/// history store.
pub struct Runtime {
    pub(crate) store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    pub(crate) router: Arc<InstanceRouter>,
    pub(crate) worker_tx: mpsc::UnboundedSender<ActivityWorkItem>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a runtime over the given store and registries. Installs a
    /// default tracing subscriber if none is set.
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let router = Arc::new(InstanceRouter::default());
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let runtime = Arc::new(Self {
            store,
            orchestrations,
            router: router.clone(),
            worker_tx,
            joins: Mutex::new(Vec::new()),
        });

        let worker = ActivityWorker::new(activities, router);
        let worker_handle = tokio::spawn(worker.run(worker_rx));
        runtime.joins.lock().await.push(worker_handle);

        runtime
    }

    /// Create an instance and begin executing the named orchestration.
    /// The instance is created Pending; the engine loop picks it up
    /// immediately. Returns without waiting for any progress.
    pub async fn start_orchestration(
        self: &Arc<Self>,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), WorkflowError> {
        let handler = self
            .orchestrations
            .get(orchestration)
            .ok_or_else(|| WorkflowError::Unregistered(orchestration.to_string()))?;

        match self.store.create_instance(instance).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(i)) => return Err(WorkflowError::AlreadyExists(i)),
            Err(e) => return Err(e.into()),
        }
        self.store
            .append(instance, Event::orchestrator_started(orchestration, input))
            .await?;

        info!(instance = %instance, orchestration = %orchestration, "started orchestration");

        let inbox = self.router.register(instance).await;
        let handle = tokio::spawn(execution::run_instance(
            self.clone(),
            instance.to_string(),
            handler,
            inbox,
        ));
        self.joins.lock().await.push(handle);
        Ok(())
    }

    /// Start the named orchestration under a fresh generated instance id.
    pub async fn start_new(
        self: &Arc<Self>,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, WorkflowError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration(&instance, orchestration, input)
            .await?;
        Ok(instance)
    }

    /// Respawn the engine loop for a persisted instance, e.g. after a
    /// process restart. Replay reconstructs the suspension point from
    /// history; scheduled work with no recorded result is dispatched again.
    pub async fn resume_instance(self: &Arc<Self>, instance: &str) -> Result<(), WorkflowError> {
        let history = match self.store.read_all(instance).await {
            Ok(h) => h,
            Err(StoreError::NotFound(i)) => return Err(WorkflowError::NotFound(i)),
            Err(e) => return Err(e.into()),
        };
        let snapshot = self.project(instance, &history).await?;
        if snapshot.runtime_status.is_terminal() {
            debug!(instance = %instance, "resume requested for terminal instance; nothing to do");
            return Ok(());
        }
        if self.router.is_registered(instance).await {
            // Engine loop already live; concurrent triggers for the same
            // instance are rejected rather than serialized.
            return Err(WorkflowError::AlreadyExists(instance.to_string()));
        }
        let name = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestratorStarted { name, .. } => Some(name.clone()),
                _ => None,
            })
            .ok_or_else(|| WorkflowError::NotFound(instance.to_string()))?;
        let handler = self
            .orchestrations
            .get(&name)
            .ok_or(WorkflowError::Unregistered(name))?;

        info!(instance = %instance, "resuming instance from persisted history");
        let inbox = self.router.register(instance).await;
        let handle = tokio::spawn(execution::run_instance(
            self.clone(),
            instance.to_string(),
            handler,
            inbox,
        ));
        self.joins.lock().await.push(handle);
        Ok(())
    }

    /// Deliver an external signal to an instance. No-op for terminal
    /// instances; buffered durably for non-terminal instances whose engine
    /// loop is not currently live (it is consumed on resume).
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), WorkflowError> {
        let name = name.into();
        let payload = payload.into();
        if self
            .router
            .try_send(
                instance,
                OrchestratorMsg::ExternalRaised {
                    name: name.clone(),
                    payload: payload.clone(),
                },
            )
            .await
            .is_ok()
        {
            return Ok(());
        }

        self.raise_event_durable(instance, name, payload).await
    }

    /// Fallback for a signal with no routable engine loop. Unknown instance
    /// is an error; a terminal one swallows the signal; otherwise persist it
    /// for a later resume (the loop is down, so there is no competing
    /// history writer).
    async fn raise_event_durable(
        &self,
        instance: &str,
        name: String,
        payload: String,
    ) -> Result<(), WorkflowError> {
        let history = match self.store.read_all(instance).await {
            Ok(h) => h,
            Err(StoreError::NotFound(i)) => return Err(WorkflowError::NotFound(i)),
            Err(e) => return Err(e.into()),
        };
        let status = status::runtime_status_of(&history, false);
        if status.is_terminal() {
            debug!(instance = %instance, signal = %name, "signal for terminal instance ignored");
            return Ok(());
        }
        self.store
            .append(instance, Event::event_raised(name, payload))
            .await?;
        // A resume may have registered a loop between the failed routed send
        // and the append. That loop can already be parked on its inbox with a
        // history read that predates the signal, so wake it for another turn.
        if self.router.is_registered(instance).await {
            let _ = self.router.try_send(instance, OrchestratorMsg::Nudge).await;
        }
        Ok(())
    }

    /// Mark a running instance Terminated. Not an interrupt: in-flight
    /// activity work cannot be preempted, only its completion dropped.
    pub async fn terminate(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), WorkflowError> {
        let reason = reason.into();
        if self
            .router
            .try_send(instance, OrchestratorMsg::Terminate { reason: reason.clone() })
            .await
            .is_ok()
        {
            return Ok(());
        }
        let history = match self.store.read_all(instance).await {
            Ok(h) => h,
            Err(StoreError::NotFound(i)) => return Err(WorkflowError::NotFound(i)),
            Err(e) => return Err(e.into()),
        };
        if status::runtime_status_of(&history, false).is_terminal() {
            return Ok(());
        }
        // Instance persisted but not running: record the terminal event
        // directly.
        self.store
            .append(
                instance,
                Event::execution_completed(crate::CompletionOutcome::Terminated { reason }),
            )
            .await?;
        Ok(())
    }

    /// Queryable snapshot of an instance: lifecycle status, per-activity
    /// progress, and the live custom-status record. Read-only; never blocks
    /// a running instance.
    pub async fn get_status(&self, instance: &str) -> Result<InstanceSnapshot, WorkflowError> {
        let history = match self.store.read_all(instance).await {
            Ok(h) => h,
            Err(StoreError::NotFound(i)) => return Err(WorkflowError::NotFound(i)),
            Err(e) => return Err(e.into()),
        };
        self.project(instance, &history).await
    }

    async fn project(
        &self,
        instance: &str,
        history: &[Event],
    ) -> Result<InstanceSnapshot, WorkflowError> {
        let custom_status = match self.store.get_custom_status(instance).await {
            Ok(s) => s,
            Err(StoreError::NotFound(i)) => return Err(WorkflowError::NotFound(i)),
            Err(e) => {
                warn!(instance = %instance, error = %e, "custom status read failed; projecting without it");
                None
            }
        };
        Ok(status::project(instance, history, custom_status))
    }

    /// Ordered event history for an instance.
    pub async fn get_history(&self, instance: &str) -> Result<Vec<Event>, WorkflowError> {
        match self.store.read_all(instance).await {
            Ok(h) => Ok(h),
            Err(StoreError::NotFound(i)) => Err(WorkflowError::NotFound(i)),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the instance reaches a terminal status or the timeout
    /// elapses.
    pub async fn wait_for_completion(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<InstanceSnapshot, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_status(instance).await {
                Ok(snapshot) if snapshot.runtime_status.is_terminal() => return Ok(snapshot),
                Ok(_) => {}
                Err(WorkflowError::NotFound(i)) => {
                    return Err(WaitError::Other(format!("instance not found: {i}")))
                }
                Err(e) => return Err(WaitError::Other(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Convenience wrapper: wait, then assert the instance Completed and
    /// return its output.
    pub async fn wait_for_output(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<String, WaitError> {
        let snapshot = self.wait_for_completion(instance, timeout).await?;
        match snapshot.runtime_status {
            RuntimeStatus::Completed => Ok(snapshot.output.unwrap_or_default()),
            other => Err(WaitError::Other(format!(
                "instance ended as {other:?}: {}",
                snapshot.output.unwrap_or_default()
            ))),
        }
    }

    /// Abort all background tasks. Persisted state survives; instances can
    /// be resumed by a fresh runtime over the same store.
    pub async fn shutdown(&self) {
        let mut joins = self.joins.lock().await;
        for handle in joins.drain(..) {
            handle.abort();
        }
    }
}
