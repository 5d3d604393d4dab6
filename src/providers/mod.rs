use async_trait::async_trait;

use crate::Event;

/// Errors from the history-store layer.
///
/// `Unavailable` is the transient class: callers of `resume`/append paths
/// retry it; the instance state is unchanged because an append either lands
/// fully or not at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only, per-instance ordered event log plus one mutable
/// custom-status record per instance.
///
/// Contract: `append` assigns strictly increasing `event_id`s per instance
/// (starting at 1), serializes appends to the same instance, and never
/// partially writes an event. Different instances append independently with
/// no cross-instance ordering. The history is the only timeline the engine
/// trusts; events are never mutated or deleted.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new, empty instance. Errors if the instance already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Append one event, assigning and returning its `event_id`.
    async fn append(&self, instance: &str, event: Event) -> Result<u64, StoreError>;

    /// Read the full ordered history for an instance.
    async fn read_all(&self, instance: &str) -> Result<Vec<Event>, StoreError>;

    /// Overwrite the instance's custom-status record (`None` clears it).
    async fn set_custom_status(
        &self,
        instance: &str,
        status: Option<String>,
    ) -> Result<(), StoreError>;

    async fn get_custom_status(&self, instance: &str) -> Result<Option<String>, StoreError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Vec<String>;

    /// Clear all store data (test utility).
    async fn reset(&self);
}

pub mod fs;
pub mod in_memory;
