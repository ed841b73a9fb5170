//! Scripted in-memory backend for exercising chains and reconciliation
//! without a cloud.

use async_trait::async_trait;
use mbroker_core::{
    BackendError, RemoteResource, ResourceKind, ResourceRecord, ResourceSpec,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::{Backend, BackendMethod, BackendOutput, RemoteQuota};

/// One call as the backend received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: BackendMethod,
    pub resource_id: String,
    pub backend_id: Option<String>,
    pub args: Value,
}

#[derive(Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    lists: Vec<(ResourceKind, Vec<String>)>,
    failures: HashMap<BackendMethod, BackendError>,
    list_failures: HashMap<ResourceKind, BackendError>,
    runtime_states: HashMap<ResourceKind, VecDeque<String>>,
    delays: HashMap<BackendMethod, Duration>,
    /// Remote objects by backend id.
    objects: HashMap<String, RemoteResource>,
    deleted: HashSet<String>,
    /// Local tenant id to the backend id it was created with.
    tenants: HashMap<String, String>,
    quotas: Vec<RemoteQuota>,
    next_id: usize,
}

/// Backend double that records calls and answers from scripted state.
///
/// Creates succeed with generated ids, pulls answer from the remote
/// objects it knows and deletes remove them. Anything can be made to
/// fail per method.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

fn default_runtime_state(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Instance => "ACTIVE",
        ResourceKind::Volume | ResourceKind::Snapshot => "available",
        _ => "",
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every call of `method` fail with `error`.
    pub fn fail(&self, method: BackendMethod, error: BackendError) {
        self.lock().failures.insert(method, error);
    }

    pub fn fail_list(&self, kind: ResourceKind, error: BackendError) {
        self.lock().list_failures.insert(kind, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.list_failures.clear();
    }

    /// Runtime states successive pulls of `kind` report. The last one
    /// sticks.
    pub fn script_runtime_states(&self, kind: ResourceKind, states: &[&str]) {
        self.lock()
            .runtime_states
            .insert(kind, states.iter().map(|s| s.to_string()).collect());
    }

    /// Delay every call of `method` by `delay` (tokio time).
    pub fn delay(&self, method: BackendMethod, delay: Duration) {
        self.lock().delays.insert(method, delay);
    }

    /// Add or replace a remote object.
    pub fn put_remote(&self, remote: RemoteResource) {
        let mut state = self.lock();
        state.deleted.remove(&remote.backend_id);
        state.objects.insert(remote.backend_id.clone(), remote);
    }

    /// Drop a remote object behind the broker's back.
    pub fn remove_remote(&self, backend_id: &str) {
        let mut state = self.lock();
        state.objects.remove(backend_id);
        state.deleted.insert(backend_id.to_string());
    }

    pub fn remote(&self, backend_id: &str) -> Option<RemoteResource> {
        self.lock().objects.get(backend_id).cloned()
    }

    pub fn set_quotas(&self, quotas: Vec<RemoteQuota>) {
        self.lock().quotas = quotas;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Names of every call so far, in order.
    pub fn call_names(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.method.name()).collect()
    }

    pub fn calls_of(&self, method: BackendMethod) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Every list call as `(kind, scope backend ids)`.
    pub fn list_calls(&self) -> Vec<(ResourceKind, Vec<String>)> {
        self.lock().lists.clone()
    }

    fn next_runtime_state(state: &mut MockState, kind: ResourceKind) -> String {
        match state.runtime_states.get_mut(&kind) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| default_runtime_state(kind).to_string()),
            None => default_runtime_state(kind).to_string(),
        }
    }

    fn apply(
        state: &mut MockState,
        method: BackendMethod,
        resource: &ResourceRecord,
        args: &Value,
    ) -> Result<BackendOutput, BackendError> {
        let gone = || BackendError::not_found(format!("{} not found", resource.id));
        match method {
            BackendMethod::Create(kind) => {
                state.next_id += 1;
                let backend_id = format!("{}-{}", kind, state.next_id);
                let runtime_state = default_runtime_state(kind).to_string();
                let mut remote =
                    RemoteResource::new(&backend_id, &resource.name, resource.spec.clone())
                        .with_runtime_state(&runtime_state);
                remote.description = resource.description.clone();
                if kind == ResourceKind::Tenant {
                    state.tenants.insert(resource.id.clone(), backend_id.clone());
                } else if let Some(scope) = state.tenants.get(&resource.scope) {
                    remote.scope_backend_id = Some(scope.clone());
                }
                if let Some(parent) = args.get("parent_backend_id").and_then(Value::as_str) {
                    remote.parent_backend_id = Some(parent.to_string());
                }
                state.objects.insert(backend_id.clone(), remote);
                Ok(BackendOutput::Created {
                    backend_id,
                    runtime_state: Some(runtime_state),
                })
            }
            BackendMethod::Pull(kind) => {
                let backend_id = resource.backend_id.as_ref().ok_or_else(gone)?;
                if state.deleted.contains(backend_id) {
                    return Err(gone());
                }
                let runtime_state = Self::next_runtime_state(state, kind);
                let remote = state.objects.entry(backend_id.clone()).or_insert_with(|| {
                    let mut remote =
                        RemoteResource::new(backend_id, &resource.name, resource.spec.clone());
                    remote.description = resource.description.clone();
                    remote
                });
                remote.runtime_state = runtime_state;
                Ok(BackendOutput::Remote(remote.clone()))
            }
            BackendMethod::Delete(_) => {
                let backend_id = resource.backend_id.as_ref().ok_or_else(gone)?;
                if !state.deleted.insert(backend_id.clone()) {
                    return Err(gone());
                }
                state.objects.remove(backend_id);
                Ok(BackendOutput::Done)
            }
            BackendMethod::SetSecurityGroupRules => {
                let Some(backend_id) = resource.backend_id.clone() else {
                    return Err(gone());
                };
                let mut rules = match &resource.spec {
                    ResourceSpec::SecurityGroup(spec) => spec.rules.clone(),
                    _ => Vec::new(),
                };
                for rule in rules.iter_mut().filter(|r| r.backend_id.is_none()) {
                    state.next_id += 1;
                    rule.backend_id = Some(format!("rule-{}", state.next_id));
                }
                if let Some(remote) = state.objects.get_mut(&backend_id)
                    && let ResourceSpec::SecurityGroup(spec) = &mut remote.spec
                {
                    spec.rules = rules;
                }
                Ok(BackendOutput::Done)
            }
            BackendMethod::PullTenantQuotas => Ok(BackendOutput::Quotas(state.quotas.clone())),
            _ => Ok(BackendOutput::Done),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn call(
        &self,
        method: BackendMethod,
        resource: &ResourceRecord,
        args: &Value,
    ) -> Result<BackendOutput, BackendError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(RecordedCall {
                method,
                resource_id: resource.id.clone(),
                backend_id: resource.backend_id.clone(),
                args: args.clone(),
            });
            state.delays.get(&method).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.failures.get(&method) {
            return Err(error.clone());
        }
        Self::apply(&mut state, method, resource, args)
    }

    async fn list(
        &self,
        kind: ResourceKind,
        scope_backend_ids: &[String],
    ) -> Result<Vec<RemoteResource>, BackendError> {
        let mut state = self.lock();
        state.lists.push((kind, scope_backend_ids.to_vec()));
        if let Some(error) = state.list_failures.get(&kind) {
            return Err(error.clone());
        }
        let mut out: Vec<RemoteResource> = state
            .objects
            .values()
            .filter(|r| r.kind() == kind)
            .filter(|r| {
                r.scope_backend_id
                    .as_ref()
                    .is_some_and(|s| scope_backend_ids.contains(s))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        Ok(out)
    }
}
