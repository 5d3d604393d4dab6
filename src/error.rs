//! Error taxonomy for the public runtime API.

use crate::providers::StoreError;

/// Errors returned by runtime management operations (start, resume, raise,
/// terminate, status). Failures inside workflow logic are not errors at this
/// level; they are recorded in history and surface through the instance's
/// terminal status.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("no handler registered for: {0}")]
    Unregistered(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from blocking waits on instance completion.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for instance completion")]
    Timeout,

    #[error("{0}")]
    Other(String),
}
