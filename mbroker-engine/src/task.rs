//! Atomic units of work.

use mbroker_core::{ResourceId, ResourceKind, ResourceState, Transition};
use serde_json::Value;
use std::time::Duration;

use crate::backend::BackendMethod;

/// Repeatedly pull a resource until its runtime state settles.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSpec {
    pub pull_method: BackendMethod,
    /// Any of these ends the poll successfully.
    pub success_runtime_states: Vec<String>,
    /// Any of these fails the task without further retries.
    pub error_runtime_states: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn new(pull_method: BackendMethod, success: &str, interval: Duration, timeout: Duration) -> Self {
        Self {
            pull_method,
            success_runtime_states: vec![success.to_string()],
            error_runtime_states: vec!["error".to_string(), "ERROR".to_string()],
            interval,
            timeout,
        }
    }

    pub fn or_success(mut self, state: &str) -> Self {
        self.success_runtime_states.push(state.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Call the backend and apply what it returns to the resource.
    Backend { method: BackendMethod, args: Value },
    /// Pure state-machine step.
    Transition(Transition),
    /// Pull and overwrite backend fields unless the record was edited
    /// locally after the pull started.
    Pull { method: BackendMethod },
    /// Poll `pull_method` until the backend reports the object gone.
    DeleteVerify {
        pull_method: BackendMethod,
        interval: Duration,
        timeout: Duration,
    },
    /// Remove the local record and give back its quota usage.
    DeleteLocal,
    /// Clear the parent link of a resource that outlives its parent.
    DetachLocal,
    /// Reconcile one kind within the resource's own scope.
    Reconcile { kind: ResourceKind },
    /// Failure path of a create: drop children that never reached the
    /// backend, mark the rest ERRED.
    Compensate { children: Vec<ResourceId> },
    /// Failure path: move the resource to ERRED with the failure message.
    MarkErred,
    /// Quota holds taken at request time become confirmed usage.
    ConfirmQuotas,
}

/// One step of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub resource_id: ResourceId,
    pub kind: TaskKind,
    /// State the resource must be in when the task starts.
    pub required_state: Option<ResourceState>,
    /// Transition applied after the task succeeded.
    pub then: Option<Transition>,
    pub poll: Option<PollSpec>,
    /// Subject to the per-kind provisioning limit.
    pub throttled: bool,
}

impl Task {
    fn new(resource_id: &str, kind: TaskKind) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            kind,
            required_state: None,
            then: None,
            poll: None,
            throttled: false,
        }
    }

    pub fn backend(resource_id: &str, method: BackendMethod) -> Self {
        Self::new(
            resource_id,
            TaskKind::Backend {
                method,
                args: Value::Null,
            },
        )
    }

    pub fn backend_with_args(resource_id: &str, method: BackendMethod, args: Value) -> Self {
        Self::new(resource_id, TaskKind::Backend { method, args })
    }

    pub fn transition(resource_id: &str, transition: Transition) -> Self {
        Self::new(resource_id, TaskKind::Transition(transition))
    }

    pub fn pull(resource_id: &str, method: BackendMethod) -> Self {
        Self::new(resource_id, TaskKind::Pull { method })
    }

    pub fn delete_verify(
        resource_id: &str,
        pull_method: BackendMethod,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self::new(
            resource_id,
            TaskKind::DeleteVerify {
                pull_method,
                interval,
                timeout,
            },
        )
    }

    pub fn delete_local(resource_id: &str) -> Self {
        Self::new(resource_id, TaskKind::DeleteLocal)
    }

    pub fn detach_local(resource_id: &str) -> Self {
        Self::new(resource_id, TaskKind::DetachLocal)
    }

    pub fn reconcile(resource_id: &str, kind: ResourceKind) -> Self {
        Self::new(resource_id, TaskKind::Reconcile { kind })
    }

    pub fn compensate(resource_id: &str, children: Vec<ResourceId>) -> Self {
        Self::new(resource_id, TaskKind::Compensate { children })
    }

    pub fn mark_erred(resource_id: &str) -> Self {
        Self::new(resource_id, TaskKind::MarkErred)
    }

    pub fn confirm_quotas(resource_id: &str) -> Self {
        Self::new(resource_id, TaskKind::ConfirmQuotas)
    }

    pub fn requires(mut self, state: ResourceState) -> Self {
        self.required_state = Some(state);
        self
    }

    pub fn then(mut self, transition: Transition) -> Self {
        self.then = Some(transition);
        self
    }

    pub fn poll(mut self, poll: PollSpec) -> Self {
        self.poll = Some(poll);
        self
    }

    pub fn throttled(mut self) -> Self {
        self.throttled = true;
        self
    }

    /// Backend method this task calls directly, if any.
    pub fn backend_method(&self) -> Option<BackendMethod> {
        match &self.kind {
            TaskKind::Backend { method, .. } | TaskKind::Pull { method } => Some(*method),
            _ => None,
        }
    }
}
