//! Turns lifecycle requests into task chains and dispatches them.
//!
//! Requests are validated and persisted synchronously: state assertions and
//! quota checks fail before anything is queued. Planning reads the store
//! but never writes it; the chain does all remote work.

mod generic;
mod instance;
mod tenant;

use mbroker_core::store::{self, StoreError};
use mbroker_core::{
    BrokerConfig, ChangedFields, CoreError, Event, EventSink, InvalidTransition, QuotaHold,
    QuotaLedger, QuotaScope, ResourceKind, ResourceRecord, ResourceRef, ResourceState,
    ResourceStore, Transition, state,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendMethod};
use crate::chain::{Operation, TaskChain};
use crate::pool::{ChainHandle, WorkerPool};
use crate::pull::ReconciliationEngine;
use crate::quotas;
use crate::runner::ChainRunner;
use crate::task::{PollSpec, Task};
use crate::throttle::ProvisionThrottle;

/// Options of a create request.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Tenant: create the default security groups and import the rest.
    pub pull_security_groups: bool,
    /// Tenant: do not connect to the configured external network.
    pub skip_external_network: bool,
    /// Instance: size of an extra data volume.
    pub data_volume_size_mb: Option<u64>,
}

/// Options of a delete request.
#[derive(Debug, Clone)]
pub struct DeleteOptions {
    /// Instance: delete data volumes instead of detaching them.
    pub delete_volumes: bool,
    /// Instance: delete the assigned floating IPs as well.
    pub release_floating_ips: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            delete_volumes: true,
            release_floating_ips: false,
        }
    }
}

pub struct Executor {
    store: Arc<dyn ResourceStore>,
    ledger: Arc<QuotaLedger>,
    events: EventSink,
    config: Arc<BrokerConfig>,
    runner: Arc<ChainRunner>,
    pool: WorkerPool,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<dyn ResourceStore>,
        ledger: Arc<QuotaLedger>,
        events: EventSink,
        config: Arc<BrokerConfig>,
    ) -> Self {
        let runner = Arc::new(ChainRunner::new(
            backend,
            store.clone(),
            ledger.clone(),
            events.clone(),
            ProvisionThrottle::new(&config.max_concurrent_provision),
            config.throttle_retry_delay(),
        ));
        let pool = WorkerPool::start(runner.clone(), config.worker_count);
        Self {
            store,
            ledger,
            events,
            config,
            runner,
            pool,
        }
    }

    pub fn runner(&self) -> Arc<ChainRunner> {
        self.runner.clone()
    }

    pub fn reconciler(&self) -> Arc<ReconciliationEngine> {
        self.runner.reconciler()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }

    /// Roll `project`'s quotas up into `customer`'s.
    pub async fn register_project(&self, project: &str, customer: &str) {
        self.ledger
            .register_scope(QuotaScope::project(project), Some(QuotaScope::customer(customer)))
            .await;
    }

    /// Link a tenant into the quota hierarchy before anything is charged to
    /// it.
    async fn register_tenant(&self, tenant: &ResourceRecord) {
        quotas::register_tenant(&self.ledger, tenant).await;
        if let Some(customer) = self.config.project_customers.get(&tenant.scope) {
            self.register_project(&tenant.scope, customer).await;
        }
    }

    async fn load(&self, id: &str) -> Result<ResourceRecord, CoreError> {
        Ok(self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?)
    }

    /// Persist a new resource with its mandatory children and start the
    /// create chain. Quota is checked before anything is written.
    pub async fn request_create(
        &self,
        record: ResourceRecord,
        options: CreateOptions,
    ) -> Result<ChainHandle, CoreError> {
        if record.state != ResourceState::CreationScheduled {
            return Err(InvalidTransition {
                resource_id: record.id.clone(),
                from: Some(record.state),
                transition: Transition::ScheduleCreating,
            }
            .into());
        }

        let children = match record.kind() {
            ResourceKind::Tenant => tenant::materialize_children(&record, &options, &self.config),
            ResourceKind::Instance => instance::materialize_volumes(&record, &options),
            _ => Vec::new(),
        };

        if record.kind() == ResourceKind::Tenant {
            self.register_tenant(&record).await;
        }

        let mut all: Vec<&ResourceRecord> = vec![&record];
        all.extend(children.iter());
        let holds = match quotas::reserve_all(&self.ledger, &all, true).await {
            Ok(holds) => holds,
            Err(e) => {
                self.abandon_create(&record, &[], &[]).await;
                return Err(e.into());
            }
        };

        let mut inserted = Vec::new();
        for r in std::iter::once(&record).chain(children.iter()) {
            match self.store.insert(r.clone()).await {
                Ok(_) => inserted.push(r.id.clone()),
                Err(e) => {
                    self.abandon_create(&record, &inserted, &holds).await;
                    return Err(e.into());
                }
            }
        }

        let mut chain = match self.plan_create(&record, &options).await {
            Ok(chain) => chain,
            Err(e) => {
                warn!(resource_id = %record.id, error = %e, "Planning create failed, abandoning request");
                self.abandon_create(&record, &inserted, &holds).await;
                return Err(e);
            }
        };
        chain.with_quota_holds(holds);

        info!(resource_id = %record.id, kind = %record.kind(), children = children.len(), "Creation scheduled");
        self.events
            .emit(Event::CreationScheduled(ResourceRef::from(&record)))
            .await;
        Ok(self.pool.dispatch(chain).await)
    }

    /// Undo a create request that never got a chain: drop what was inserted,
    /// newest first, and cancel the holds.
    async fn abandon_create(
        &self,
        record: &ResourceRecord,
        inserted: &[String],
        holds: &[QuotaHold],
    ) {
        for id in inserted.iter().rev() {
            if let Err(e) = self.store.delete(id).await {
                warn!(resource_id = %id, error = %e, "Failed to remove record of abandoned create");
            }
        }
        self.ledger.cancel_holds(holds).await;
        // a conflicting insert means the tenant is someone else's
        if record.kind() == ResourceKind::Tenant
            && matches!(self.store.get(&record.id).await, Ok(None))
        {
            quotas::forget_tenant(&self.ledger, record).await;
        }
    }

    /// Save a locally edited record and start the update chain.
    ///
    /// `edited` must carry the version it was derived from.
    pub async fn request_update(&self, edited: ResourceRecord) -> Result<ChainHandle, CoreError> {
        let current = self.load(&edited.id).await?;
        if !state::can_transition(Some(current.state), Transition::ScheduleUpdating) {
            return Err(InvalidTransition {
                resource_id: current.id,
                from: Some(current.state),
                transition: Transition::ScheduleUpdating,
            }
            .into());
        }

        let changed = ChangedFields::between(&current, &edited);
        let holds = quotas::reserve_growth(&self.ledger, &current, &edited).await?;

        let mut edited = edited;
        edited.touch();
        let saved = match store::save_transition(
            self.store.as_ref(),
            edited.clone(),
            Transition::ScheduleUpdating,
        )
        .await
        {
            Ok(saved) => saved,
            Err(e) => {
                // back to the usage of the unchanged record
                if let Err(q) = quotas::revert_growth(&self.ledger, &current, &edited, &holds).await {
                    warn!(resource_id = %current.id, error = %q, "Failed to restore quota usage");
                }
                return Err(e);
            }
        };

        debug!(resource_id = %saved.id, changed = ?changed, "Update scheduled");
        self.events
            .emit(Event::UpdateScheduled(ResourceRef::from(&saved)))
            .await;

        let mut chain = match self.plan_update(&saved, &changed).await {
            Ok(chain) => chain,
            Err(e) => {
                // the edit is saved, so the usage stays with it
                self.ledger.confirm_holds(&holds).await;
                self.fail_unplanned(&saved.id, &e).await;
                return Err(e);
            }
        };
        chain.with_quota_holds(holds);
        Ok(self.pool.dispatch(chain).await)
    }

    pub async fn request_delete(
        &self,
        id: &str,
        options: DeleteOptions,
    ) -> Result<ChainHandle, CoreError> {
        let saved = store::transition(self.store.as_ref(), id, Transition::ScheduleDeleting).await?;
        self.events
            .emit(Event::DeletionScheduled(ResourceRef::from(&saved)))
            .await;
        let chain = match self.plan_delete(&saved, &options).await {
            Ok(chain) => chain,
            Err(e) => {
                self.fail_unplanned(&saved.id, &e).await;
                return Err(e);
            }
        };
        Ok(self.pool.dispatch(chain).await)
    }

    /// A scheduled record whose chain could not be planned would sit in its
    /// scheduled state forever. Mark it ERRED instead.
    async fn fail_unplanned(&self, id: &str, error: &CoreError) {
        let result = async {
            let mut record = self.load(id).await?;
            record.set_erred(format!("planning failed: {}", error))?;
            let saved = self.store.update(record).await?;
            Ok::<_, CoreError>(saved)
        }
        .await;
        match result {
            Ok(saved) => {
                self.events
                    .emit(Event::Erred {
                        resource: ResourceRef::from(&saved),
                        message: saved.error_message.clone().unwrap_or_default(),
                    })
                    .await;
            }
            Err(e) => warn!(resource_id = %id, error = %e, "Failed to mark unplanned record ERRED"),
        }
    }

    pub async fn request_pull(&self, id: &str) -> Result<ChainHandle, CoreError> {
        let saved = store::transition(self.store.as_ref(), id, Transition::ScheduleUpdating).await?;
        let chain = self.plan_pull(&saved);
        Ok(self.pool.dispatch(chain).await)
    }

    /// Chain materialising `record` and its mandatory children.
    pub async fn plan_create(
        &self,
        record: &ResourceRecord,
        options: &CreateOptions,
    ) -> Result<TaskChain, CoreError> {
        match record.kind() {
            ResourceKind::Tenant => self.plan_tenant_create(record, options).await,
            ResourceKind::Instance => self.plan_instance_create(record).await,
            _ => Ok(self.plan_generic_create(record)),
        }
    }

    /// Chain pushing `changed` to the backend, or a bare transition when no
    /// backend-relevant field changed.
    pub async fn plan_update(
        &self,
        record: &ResourceRecord,
        changed: &ChangedFields,
    ) -> Result<TaskChain, CoreError> {
        let mut chain = TaskChain::new(&record.id, Operation::Update);
        chain.on_failure(Task::mark_erred(&record.id));

        if !changed.intersects(record.kind().update_fields()) {
            debug!(resource_id = %record.id, "No backend field changed, skipping backend");
            chain.push(
                Task::transition(&record.id, Transition::SetOk)
                    .requires(ResourceState::UpdateScheduled),
            );
            return Ok(chain);
        }

        chain.push(
            Task::transition(&record.id, Transition::BeginUpdating)
                .requires(ResourceState::UpdateScheduled),
        );
        let steps = match record.kind() {
            ResourceKind::Instance => self.instance_update_steps(record, changed).await?,
            _ => self.generic_update_steps(record, changed),
        };
        chain.extend(steps);
        chain.on_success(Task::transition(&record.id, Transition::SetOk));
        Ok(chain)
    }

    /// Chain removing `record` remotely and locally. Records that never got
    /// a backend id are removed locally only.
    pub async fn plan_delete(
        &self,
        record: &ResourceRecord,
        options: &DeleteOptions,
    ) -> Result<TaskChain, CoreError> {
        let mut chain = TaskChain::new(&record.id, Operation::Delete);

        if record.backend_id.is_none() {
            for child in self.descendants(&record.id).await? {
                chain.push(Task::delete_local(&child.id));
            }
            chain.push(Task::delete_local(&record.id));
            return Ok(chain);
        }

        chain.on_failure(Task::mark_erred(&record.id));
        chain.push(
            Task::transition(&record.id, Transition::BeginDeleting)
                .requires(ResourceState::DeletionScheduled),
        );
        let steps = match record.kind() {
            ResourceKind::Tenant => self.tenant_delete_steps(record).await?,
            ResourceKind::Instance => self.instance_delete_steps(record, options).await?,
            _ => self.generic_delete_steps(record).await?,
        };
        chain.extend(steps);
        Ok(chain)
    }

    /// Chain refreshing backend fields, guarded against newer local edits.
    pub fn plan_pull(&self, record: &ResourceRecord) -> TaskChain {
        let kind = record.kind();
        let mut chain = TaskChain::new(&record.id, Operation::Pull);
        chain.push(
            Task::pull(&record.id, BackendMethod::Pull(kind))
                .requires(ResourceState::UpdateScheduled),
        );
        if kind == ResourceKind::Tenant {
            chain.push(Task::pull(&record.id, BackendMethod::PullTenantQuotas));
        }
        chain
            .on_success(Task::transition(&record.id, Transition::SetOk))
            .on_failure(Task::mark_erred(&record.id));
        chain
    }

    /// Every record below `id`, deepest first.
    async fn descendants(&self, id: &str) -> Result<Vec<ResourceRecord>, CoreError> {
        let mut out = Vec::new();
        let mut stack = vec![(id.to_string(), false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                if current != id
                    && let Some(record) = self.store.get(&current).await?
                {
                    out.push(record);
                }
                continue;
            }
            stack.push((current.clone(), true));
            for child in self.store.list_children(&current).await? {
                stack.push((child.id, false));
            }
        }
        Ok(out)
    }

    /// Delete, confirm the deletion, then drop the local record. Kinds the
    /// backend removes synchronously get a short confirmation window.
    fn delete_steps(&self, record: &ResourceRecord) -> Vec<Task> {
        if record.backend_id.is_none() {
            return vec![Task::delete_local(&record.id)];
        }
        let kind = record.kind();
        let poll = &self.config.poll;
        let timeout = match kind {
            ResourceKind::Instance => poll.instance_timeout(),
            _ if kind.deletes_asynchronously() => poll.deletion_timeout(),
            _ => poll.interval(),
        };
        vec![
            Task::backend(&record.id, BackendMethod::Delete(kind)),
            Task::delete_verify(&record.id, BackendMethod::Pull(kind), poll.interval(), timeout),
            Task::delete_local(&record.id),
        ]
    }

    fn poll_until(&self, kind: ResourceKind, state: &str) -> PollSpec {
        let timeout = if kind == ResourceKind::Instance {
            self.config.poll.instance_timeout()
        } else {
            self.config.poll.timeout()
        };
        PollSpec::new(
            BackendMethod::Pull(kind),
            state,
            self.config.poll.interval(),
            timeout,
        )
    }
}
