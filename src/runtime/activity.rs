use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::registry::ActivityRegistry;
use super::router::{InstanceRouter, OrchestratorMsg};

/// One unit of remote work dispatched by the engine.
#[derive(Debug)]
pub struct ActivityWorkItem {
    pub instance: String,
    pub scheduled_event_id: u64,
    pub name: String,
    pub input: String,
}

/// Executes dispatched activities and reports completion or failure back to
/// the owning instance through the router.
///
/// Invocation is non-blocking for the engine: each work item runs in its own
/// spawned task, so a multi-second remote call never holds the engine's
/// execution slot. There is no automatic retry; workflow logic that wants a
/// retry must re-invoke the activity explicitly.
pub struct ActivityWorker {
    registry: ActivityRegistry,
    router: Arc<InstanceRouter>,
}

impl ActivityWorker {
    pub fn new(registry: ActivityRegistry, router: Arc<InstanceRouter>) -> Self {
        Self { registry, router }
    }

    /// Run the worker loop until the work channel is closed.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<ActivityWorkItem>) {
        let worker = Arc::new(self);
        while let Some(item) = rx.recv().await {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker.execute(item).await;
            });
        }
    }

    async fn execute(&self, item: ActivityWorkItem) {
        debug!(
            instance = %item.instance,
            activity = %item.name,
            scheduled_event_id = item.scheduled_event_id,
            "executing activity"
        );
        let msg = match self.registry.get(&item.name) {
            Some(handler) => match handler.invoke(item.input).await {
                Ok(result) => OrchestratorMsg::ActivityCompleted {
                    scheduled_event_id: item.scheduled_event_id,
                    result,
                },
                Err(reason) => OrchestratorMsg::ActivityFailed {
                    scheduled_event_id: item.scheduled_event_id,
                    reason,
                },
            },
            None => OrchestratorMsg::ActivityFailed {
                scheduled_event_id: item.scheduled_event_id,
                reason: format!("unregistered:{}", item.name),
            },
        };
        // The instance may have been terminated while the activity ran;
        // the completion is simply dropped in that case.
        let _ = self.router.try_send(&item.instance, msg).await;
    }
}
