use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{HistoryStore, StoreError};
use crate::Event;

#[derive(Default)]
struct InstanceState {
    events: Vec<Event>,
    next_event_id: u64,
    custom_status: Option<String>,
}

/// In-memory history store for tests and single-process use.
///
/// Each instance sits behind its own lock so appends to different instances
/// never contend; the outer map lock is held only to look up the entry.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    instances: RwLock<HashMap<String, Arc<Mutex<InstanceState>>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn instance(&self, instance: &str) -> Result<Arc<Mutex<InstanceState>>, StoreError> {
        self.instances
            .read()
            .await
            .get(instance)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(instance.to_string()))
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut map = self.instances.write().await;
        if map.contains_key(instance) {
            return Err(StoreError::AlreadyExists(instance.to_string()));
        }
        map.insert(
            instance.to_string(),
            Arc::new(Mutex::new(InstanceState {
                events: Vec::new(),
                next_event_id: 1,
                custom_status: None,
            })),
        );
        Ok(())
    }

    async fn append(&self, instance: &str, event: Event) -> Result<u64, StoreError> {
        let state = self.instance(instance).await?;
        let mut state = state.lock().await;
        let id = state.next_event_id;
        state.next_event_id += 1;
        state.events.push(event.with_event_id(id));
        Ok(id)
    }

    async fn read_all(&self, instance: &str) -> Result<Vec<Event>, StoreError> {
        let state = self.instance(instance).await?;
        let state = state.lock().await;
        Ok(state.events.clone())
    }

    async fn set_custom_status(
        &self,
        instance: &str,
        status: Option<String>,
    ) -> Result<(), StoreError> {
        let state = self.instance(instance).await?;
        state.lock().await.custom_status = status;
        Ok(())
    }

    async fn get_custom_status(&self, instance: &str) -> Result<Option<String>, StoreError> {
        let state = self.instance(instance).await?;
        let state = state.lock().await;
        Ok(state.custom_status.clone())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }

    async fn reset(&self) {
        self.instances.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_strictly_increasing_ids() {
        let store = InMemoryHistoryStore::new();
        store.create_instance("i1").await.unwrap();
        let a = store
            .append("i1", Event::orchestrator_started("O", "in"))
            .await
            .unwrap();
        let b = store
            .append("i1", Event::task_scheduled("A", "x"))
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
        let hist = store.read_all("i1").await.unwrap();
        assert_eq!(hist.len(), 2);
        assert!(hist.windows(2).all(|w| w[0].event_id() < w[1].event_id()));
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let store = InMemoryHistoryStore::new();
        assert!(matches!(
            store.read_all("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.append("nope", Event::task_scheduled("A", "")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryHistoryStore::new();
        store.create_instance("i1").await.unwrap();
        assert!(matches!(
            store.create_instance("i1").await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn instances_have_independent_id_sequences() {
        let store = InMemoryHistoryStore::new();
        store.create_instance("i1").await.unwrap();
        store.create_instance("i2").await.unwrap();
        store
            .append("i1", Event::orchestrator_started("O", ""))
            .await
            .unwrap();
        let id = store
            .append("i2", Event::orchestrator_started("O", ""))
            .await
            .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn custom_status_round_trips_and_clears() {
        let store = InMemoryHistoryStore::new();
        store.create_instance("i1").await.unwrap();
        assert_eq!(store.get_custom_status("i1").await.unwrap(), None);
        store
            .set_custom_status("i1", Some("stage-1".into()))
            .await
            .unwrap();
        assert_eq!(
            store.get_custom_status("i1").await.unwrap(),
            Some("stage-1".into())
        );
        store.set_custom_status("i1", None).await.unwrap();
        assert_eq!(store.get_custom_status("i1").await.unwrap(), None);
    }
}
