//! Chain failures.

use mbroker_core::{BackendError, CoreError, InvalidTransition, ResourceState, StoreError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("resource {resource_id} is {actual}, expected {expected}")]
    UnexpectedState {
        resource_id: String,
        expected: ResourceState,
        actual: ResourceState,
    },

    #[error("{method} failed: {source}")]
    Backend {
        method: String,
        #[source]
        source: BackendError,
    },

    #[error("{method} did not reach {expected} within {timeout:?}")]
    PollTimeout {
        method: String,
        expected: String,
        timeout: Duration,
    },

    #[error("{method} reported runtime state {runtime_state}")]
    PollFailed {
        method: String,
        runtime_state: String,
    },

    #[error("resource {0} not found")]
    ResourceGone(String),

    #[error("store: {0}")]
    Store(String),

    #[error("worker pool stopped before the chain finished")]
    WorkerGone,
}

impl ChainError {
    pub fn backend(method: impl ToString, source: BackendError) -> Self {
        ChainError::Backend {
            method: method.to_string(),
            source,
        }
    }
}

impl From<StoreError> for ChainError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ChainError::ResourceGone(id),
            other => ChainError::Store(other.to_string()),
        }
    }
}

impl From<CoreError> for ChainError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidTransition(e) => ChainError::InvalidTransition(e),
            CoreError::Backend(e) => ChainError::backend("backend", e),
            CoreError::Store(e) => e.into(),
            CoreError::QuotaExceeded(e) => ChainError::Store(e.to_string()),
        }
    }
}
