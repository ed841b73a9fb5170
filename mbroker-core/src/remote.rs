//! Remote representations and normalised backend failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::{ResourceKind, ResourceSpec};

/// A resource as reported by the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub backend_id: String,
    /// Backend id of the owning scope (e.g. the tenant).
    #[serde(default)]
    pub scope_backend_id: Option<String>,
    #[serde(default)]
    pub parent_backend_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub runtime_state: String,
    pub spec: ResourceSpec,
}

impl RemoteResource {
    pub fn new(backend_id: impl Into<String>, name: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            backend_id: backend_id.into(),
            scope_backend_id: None,
            parent_backend_id: None,
            name: name.into(),
            description: String::new(),
            runtime_state: String::new(),
            spec,
        }
    }

    pub fn with_scope(mut self, scope_backend_id: impl Into<String>) -> Self {
        self.scope_backend_id = Some(scope_backend_id.into());
        self
    }

    pub fn with_parent(mut self, parent_backend_id: impl Into<String>) -> Self {
        self.parent_backend_id = Some(parent_backend_id.into());
        self
    }

    pub fn with_runtime_state(mut self, runtime_state: impl Into<String>) -> Self {
        self.runtime_state = runtime_state.into();
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }
}

/// Coarse class of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    NotFound,
    Conflict,
    Unavailable,
    Other,
}

/// Remote API failure, normalised from whatever the backend client raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("backend error ({kind:?}): {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unavailable, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Other, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }
}
