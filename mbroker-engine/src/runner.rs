//! Runs task chains.

use chrono::Utc;
use mbroker_core::store::{self, StoreError};
use mbroker_core::{
    Event, EventSink, PullOutcome, QuotaHold, QuotaLedger, ResourceKind, ResourceRecord,
    ResourceRef, ResourceState, ResourceStore, Transition,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendMethod, BackendOutput};
use crate::chain::{Operation, TaskChain};
use crate::error::ChainError;
use crate::pull::{ReconciliationEngine, ScopeKey};
use crate::quotas;
use crate::task::{PollSpec, Task, TaskKind};
use crate::throttle::ProvisionThrottle;

/// Final result of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub resource_id: String,
    pub operation: Operation,
    pub result: Result<(), ChainError>,
}

impl ChainOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// What a task can see of the chain it belongs to.
struct ChainContext<'a> {
    root_id: &'a str,
    operation: Operation,
    holds: &'a [QuotaHold],
    failure: Option<&'a ChainError>,
}

pub struct ChainRunner {
    backend: Arc<dyn Backend>,
    store: Arc<dyn ResourceStore>,
    ledger: Arc<QuotaLedger>,
    events: EventSink,
    reconciler: Arc<ReconciliationEngine>,
    throttle: ProvisionThrottle,
    retry_delay: Duration,
}

impl ChainRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<dyn ResourceStore>,
        ledger: Arc<QuotaLedger>,
        events: EventSink,
        throttle: ProvisionThrottle,
        retry_delay: Duration,
    ) -> Self {
        let reconciler = Arc::new(ReconciliationEngine::new(
            backend.clone(),
            store.clone(),
            ledger.clone(),
            events.clone(),
        ));
        Self {
            backend,
            store,
            ledger,
            events,
            reconciler,
            throttle,
            retry_delay,
        }
    }

    pub fn reconciler(&self) -> Arc<ReconciliationEngine> {
        self.reconciler.clone()
    }

    /// Run every task in order, then the matching continuation.
    pub async fn run(&self, chain: TaskChain) -> ChainOutcome {
        info!(
            resource_id = %chain.resource_id,
            operation = %chain.operation,
            tasks = chain.tasks.len(),
            "Running chain"
        );

        let mut ctx = ChainContext {
            root_id: &chain.resource_id,
            operation: chain.operation,
            holds: &chain.quota_holds,
            failure: None,
        };

        let mut result = Ok(());
        for (step, task) in chain.tasks.iter().enumerate() {
            if let Err(e) = self.run_task(task, &ctx).await {
                warn!(
                    resource_id = %chain.resource_id,
                    step,
                    task_resource = %task.resource_id,
                    error = %e,
                    "Chain step failed"
                );
                result = Err(e);
                break;
            }
        }

        if result.is_ok() {
            for task in &chain.on_success {
                if let Err(e) = self.run_task(task, &ctx).await {
                    error!(resource_id = %chain.resource_id, error = %e, "Success continuation failed");
                    result = Err(e);
                    break;
                }
            }
        }

        if let Err(failure) = &result {
            ctx.failure = Some(failure);
            for task in &chain.on_failure {
                // keep going, every compensation step is independent
                if let Err(e) = self.run_task(task, &ctx).await {
                    error!(
                        resource_id = %chain.resource_id,
                        task_resource = %task.resource_id,
                        error = %e,
                        "Failure continuation step failed"
                    );
                }
            }
        }

        match &result {
            Ok(()) => info!(resource_id = %chain.resource_id, operation = %chain.operation, "Chain succeeded"),
            Err(e) => warn!(resource_id = %chain.resource_id, operation = %chain.operation, error = %e, "Chain failed"),
        }

        ChainOutcome {
            resource_id: chain.resource_id.clone(),
            operation: chain.operation,
            result,
        }
    }

    async fn load(&self, id: &str) -> Result<ResourceRecord, ChainError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ChainError::ResourceGone(id.to_string()))
    }

    async fn run_task(&self, task: &Task, ctx: &ChainContext<'_>) -> Result<(), ChainError> {
        let record = match self.store.get(&task.resource_id).await? {
            Some(record) => record,
            // already gone is the goal of these
            None if matches!(task.kind, TaskKind::DeleteLocal | TaskKind::MarkErred) => {
                return Ok(());
            }
            // holds outlive a record dropped by compensation
            None if matches!(task.kind, TaskKind::ConfirmQuotas) => {
                self.confirm_quotas(task, ctx).await;
                return Ok(());
            }
            None => return Err(ChainError::ResourceGone(task.resource_id.clone())),
        };

        if let Some(expected) = task.required_state
            && record.state != expected
        {
            return Err(ChainError::UnexpectedState {
                resource_id: record.id,
                expected,
                actual: record.state,
            });
        }

        let _permit = if task.throttled {
            let kind = record.kind();
            loop {
                if let Some(permit) = self.throttle.try_acquire(kind) {
                    break Some(permit);
                }
                debug!(kind = %kind, resource_id = %record.id, "Provisioning limit reached, rescheduling");
                sleep(self.retry_delay).await;
            }
        } else {
            None
        };

        match &task.kind {
            TaskKind::Backend { method, args } => {
                self.call_backend(record, *method, args).await?;
            }
            TaskKind::Transition(transition) => {
                self.transition(record, *transition, ctx).await?;
            }
            TaskKind::Pull { method } => self.pull(record, *method).await?,
            TaskKind::DeleteVerify {
                pull_method,
                interval,
                timeout,
            } => {
                self.verify_deleted(&record, *pull_method, *interval, *timeout)
                    .await?
            }
            TaskKind::DeleteLocal => self.delete_local(record).await?,
            TaskKind::DetachLocal => {
                let mut record = record;
                record.parent_id = None;
                self.store.update(record).await?;
            }
            TaskKind::Reconcile { kind } => {
                let Some(scope) = ScopeKey::for_tenant(&record) else {
                    return Err(ChainError::ResourceGone(format!(
                        "{} has no backend id to reconcile under",
                        record.id
                    )));
                };
                self.reconciler
                    .reconcile(*kind, &[scope])
                    .await
                    .map_err(|e| ChainError::backend(format!("list_{}", kind), e))?;
            }
            TaskKind::Compensate { children } => self.compensate(children, ctx).await,
            TaskKind::MarkErred => {
                let message = ctx
                    .failure
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "operation failed".to_string());
                self.mark_erred(record, message).await?;
            }
            TaskKind::ConfirmQuotas => self.confirm_quotas(task, ctx).await,
        }

        if let Some(poll) = &task.poll {
            self.poll(&task.resource_id, poll).await?;
        }

        if let Some(transition) = task.then {
            let record = self.load(&task.resource_id).await?;
            self.transition(record, transition, ctx).await?;
        }

        Ok(())
    }

    async fn call_backend(
        &self,
        mut record: ResourceRecord,
        method: BackendMethod,
        args: &Value,
    ) -> Result<(), ChainError> {
        debug!(resource_id = %record.id, method = %method, "Calling backend");
        let args = self.enrich_args(&record, method, args).await?;
        let output = match self.backend.call(method, &record, &args).await {
            Ok(output) => output,
            Err(e) if method.is_delete() && e.is_not_found() => {
                debug!(resource_id = %record.id, method = %method, "Already gone remotely");
                return Ok(());
            }
            Err(e) => return Err(ChainError::backend(method, e)),
        };

        match output {
            BackendOutput::Done => {}
            BackendOutput::Created {
                backend_id,
                runtime_state,
            } => {
                record.backend_id = Some(backend_id);
                if let Some(runtime_state) = runtime_state {
                    record.runtime_state = runtime_state;
                }
                self.store.update(record).await?;
            }
            BackendOutput::Remote(remote) => {
                if let PullOutcome::Applied { changed, .. } = record.pull_from(&remote, None)
                    && !changed.is_empty()
                {
                    self.store.update(record).await?;
                }
            }
            BackendOutput::Quotas(remote) => {
                let scope = mbroker_core::QuotaScope::tenant(record.id.clone());
                self.reconciler.apply_quotas(&scope, &remote).await;
            }
        }
        Ok(())
    }

    /// Add what only exists at run time: the parent's backend id, and for
    /// creates the backend ids of already created children.
    async fn enrich_args(
        &self,
        record: &ResourceRecord,
        method: BackendMethod,
        args: &Value,
    ) -> Result<Value, ChainError> {
        let mut args = match args {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map.clone(),
            other => return Ok(other.clone()),
        };

        if let Some(parent_id) = &record.parent_id
            && let Some(parent) = self.store.get(parent_id).await?
            && let Some(backend_id) = parent.backend_id
        {
            args.insert("parent_backend_id".into(), Value::String(backend_id));
        }

        if matches!(method, BackendMethod::Create(_)) {
            let children: Vec<Value> = self
                .store
                .list_children(&record.id)
                .await?
                .into_iter()
                .filter_map(|c| {
                    c.backend_id.map(|bid| {
                        serde_json::json!({ "kind": c.spec.kind(), "backend_id": bid })
                    })
                })
                .collect();
            if !children.is_empty() {
                args.insert("children".into(), Value::Array(children));
            }
        }

        Ok(Value::Object(args))
    }

    async fn transition(
        &self,
        record: ResourceRecord,
        transition: Transition,
        ctx: &ChainContext<'_>,
    ) -> Result<(), ChainError> {
        let from = record.state;
        let saved = store::save_transition(self.store.as_ref(), record, transition).await?;
        debug!(resource_id = %saved.id, from = %from, to = %saved.state, "Transition applied");

        if saved.state == ResourceState::Ok && ctx.operation != Operation::Pull {
            let resource = ResourceRef::from(&saved);
            match from {
                ResourceState::CreationScheduled | ResourceState::Creating => {
                    self.events.emit(Event::Created(resource)).await
                }
                ResourceState::UpdateScheduled | ResourceState::Updating => {
                    self.events
                        .emit(Event::Updated {
                            resource,
                            changed: Vec::new(),
                        })
                        .await
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Pull with the snapshot guard: a record edited locally after the call
    /// started keeps its local values.
    async fn pull(&self, record: ResourceRecord, method: BackendMethod) -> Result<(), ChainError> {
        let started_at = Utc::now();
        let remote = match self.backend.call(method, &record, &Value::Null).await {
            Ok(BackendOutput::Remote(remote)) => remote,
            Ok(BackendOutput::Quotas(remote)) => {
                let scope = mbroker_core::QuotaScope::tenant(record.id.clone());
                self.reconciler.apply_quotas(&scope, &remote).await;
                return Ok(());
            }
            Ok(_) => return Ok(()),
            Err(e) => return Err(ChainError::backend(method, e)),
        };

        let mut current = self.load(&record.id).await?;
        match current.pull_from(&remote, Some(started_at)) {
            PullOutcome::Stale => {
                info!(resource_id = %current.id, "Local edit is newer than the pulled snapshot, keeping it");
            }
            PullOutcome::Applied {
                changed,
                removed_rules,
            } => {
                if changed.is_empty() {
                    return Ok(());
                }
                let saved = match self.store.update(current).await {
                    Ok(saved) => saved,
                    Err(StoreError::VersionMismatch { .. }) => {
                        info!(resource_id = %record.id, "Record changed during pull, keeping local values");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                let resource = ResourceRef::from(&saved);
                for rule in removed_rules {
                    self.events
                        .emit(Event::SecurityGroupRuleRemoved {
                            group: resource.clone(),
                            rule,
                        })
                        .await;
                }
                self.events.emit(Event::Pulled { resource, changed }).await;
            }
        }
        Ok(())
    }

    /// Pull until the runtime state reaches a success or error value.
    async fn poll(&self, resource_id: &str, poll: &PollSpec) -> Result<(), ChainError> {
        let deadline = Instant::now() + poll.timeout;
        loop {
            let mut record = self.load(resource_id).await?;
            let remote = match self.backend.call(poll.pull_method, &record, &Value::Null).await {
                Ok(BackendOutput::Remote(remote)) => remote,
                Ok(_) => return Ok(()),
                Err(e) => return Err(ChainError::backend(poll.pull_method, e)),
            };

            let runtime_state = remote.runtime_state.clone();
            if let PullOutcome::Applied { changed, .. } = record.pull_from(&remote, None)
                && !changed.is_empty()
            {
                self.store.update(record).await?;
            }

            if poll.success_runtime_states.contains(&runtime_state) {
                debug!(resource_id, runtime_state = %runtime_state, "Poll reached target state");
                return Ok(());
            }
            if poll.error_runtime_states.contains(&runtime_state) {
                return Err(ChainError::PollFailed {
                    method: poll.pull_method.name(),
                    runtime_state,
                });
            }
            if Instant::now() + poll.interval > deadline {
                return Err(ChainError::PollTimeout {
                    method: poll.pull_method.name(),
                    expected: poll.success_runtime_states.join("|"),
                    timeout: poll.timeout,
                });
            }
            sleep(poll.interval).await;
        }
    }

    /// Pull until the backend no longer knows the object.
    async fn verify_deleted(
        &self,
        record: &ResourceRecord,
        pull_method: BackendMethod,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), ChainError> {
        if record.backend_id.is_none() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.backend.call(pull_method, record, &Value::Null).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(ChainError::backend(pull_method, e)),
                Ok(_) => {}
            }
            if Instant::now() + interval > deadline {
                return Err(ChainError::PollTimeout {
                    method: pull_method.name(),
                    expected: "deleted".to_string(),
                    timeout,
                });
            }
            sleep(interval).await;
        }
    }

    async fn confirm_quotas(&self, task: &Task, ctx: &ChainContext<'_>) {
        self.ledger.confirm_holds(ctx.holds).await;
        debug!(resource_id = %task.resource_id, holds = ctx.holds.len(), "Quota holds confirmed");
    }

    async fn delete_local(&self, record: ResourceRecord) -> Result<(), ChainError> {
        if self.store.delete(&record.id).await? {
            quotas::release_all(&self.ledger, &record).await;
            if record.kind() == ResourceKind::Tenant {
                quotas::forget_tenant(&self.ledger, &record).await;
            }
            self.events
                .emit(Event::Deleted(ResourceRef::from(&record)))
                .await;
        }
        Ok(())
    }

    async fn mark_erred(&self, mut record: ResourceRecord, message: String) -> Result<(), ChainError> {
        let id = record.id.clone();
        record.set_erred(message.clone())?;
        let saved = match self.store.update(record).await {
            Ok(saved) => saved,
            // one retry against the latest version
            Err(StoreError::VersionMismatch { .. }) => {
                let mut record = self.load(&id).await?;
                record.set_erred(message.clone())?;
                self.store.update(record).await?
            }
            Err(e) => return Err(e.into()),
        };
        self.events
            .emit(Event::Erred {
                resource: ResourceRef::from(&saved),
                message,
            })
            .await;
        Ok(())
    }

    /// Children still in CREATION_SCHEDULED without a backend id never
    /// reached the backend and are dropped. Anything further along may exist
    /// remotely and is only marked ERRED. OK children are left as they are.
    async fn compensate(&self, children: &[String], ctx: &ChainContext<'_>) {
        let reason = ctx
            .failure
            .map(|e| format!("creation of parent {} failed: {}", ctx.root_id, e))
            .unwrap_or_else(|| format!("creation of parent {} failed", ctx.root_id));

        for child_id in children {
            let child = match self.store.get(child_id).await {
                Ok(Some(child)) => child,
                Ok(None) => continue,
                Err(e) => {
                    warn!(resource_id = %child_id, error = %e, "Failed to load child for compensation");
                    continue;
                }
            };

            let result = if child.state == ResourceState::CreationScheduled
                && child.backend_id.is_none()
            {
                debug!(resource_id = %child.id, "Dropping child that was never created remotely");
                self.delete_local(child).await
            } else if child.state == ResourceState::Ok {
                Ok(())
            } else {
                self.mark_erred(child, reason.clone()).await
            };
            if let Err(e) = result {
                warn!(resource_id = %child_id, error = %e, "Compensation step failed");
            }
        }
    }
}
