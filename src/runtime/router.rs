use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Messages delivered to a running instance's engine loop. The engine is the
/// only history writer; activity completions and external signals both go
/// through here and are buffered in the inbox until the engine next checks.
#[derive(Debug)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        scheduled_event_id: u64,
        result: String,
    },
    ActivityFailed {
        scheduled_event_id: u64,
        reason: String,
    },
    ExternalRaised {
        name: String,
        payload: String,
    },
    Terminate {
        reason: String,
    },
    /// Wake the engine for another turn without appending anything. Sent
    /// when an event was written to history behind the loop's back.
    Nudge,
}

pub fn kind_of(msg: &OrchestratorMsg) -> &'static str {
    match msg {
        OrchestratorMsg::ActivityCompleted { .. } => "ActivityCompleted",
        OrchestratorMsg::ActivityFailed { .. } => "ActivityFailed",
        OrchestratorMsg::ExternalRaised { .. } => "ExternalRaised",
        OrchestratorMsg::Terminate { .. } => "Terminate",
        OrchestratorMsg::Nudge => "Nudge",
    }
}

/// Routes messages to per-instance inboxes.
#[derive(Default)]
pub struct InstanceRouter {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    pub async fn is_registered(&self, instance: &str) -> bool {
        self.inboxes.lock().await.contains_key(instance)
    }

    /// Send a message to an instance's inbox. Returns `Err` when the
    /// instance has no live engine loop; the sender decides what that means.
    pub async fn try_send(&self, instance: &str, msg: OrchestratorMsg) -> Result<(), ()> {
        let kind = kind_of(&msg);
        let mut map = self.inboxes.lock().await;
        match map.get(instance) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    // Receiver dropped; remove the stale sender.
                    map.remove(instance);
                    warn!(instance = %instance, kind = %kind, "router: receiver dropped, removing inbox");
                    return Err(());
                }
                Ok(())
            }
            None => Err(()),
        }
    }
}
