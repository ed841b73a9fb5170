//! Converges local records toward the remote collection.

use chrono::{DateTime, Utc};
use mbroker_core::store::StoreError;
use mbroker_core::{
    BackendError, Event, EventSink, PullOutcome, QuotaLedger, QuotaScope, RemoteResource,
    ResourceKind, ResourceRecord, ResourceRef, ResourceSpec, ResourceStore, diff_by_key,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendMethod, BackendOutput, RemoteQuota};
use crate::quotas;

/// A backend scope: the local scope key and the id the backend knows it by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub scope: String,
    pub backend_id: String,
}

impl ScopeKey {
    pub fn new(scope: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            backend_id: backend_id.into(),
        }
    }

    /// Scope of a tenant's sub-resources, once the tenant exists remotely.
    pub fn for_tenant(tenant: &ResourceRecord) -> Option<Self> {
        tenant
            .backend_id
            .as_ref()
            .map(|bid| Self::new(tenant.id.clone(), bid.clone()))
    }
}

/// Counters of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub imported: usize,
    pub updated: usize,
    pub cleaned: usize,
    /// Records left alone: mid-transition, edited after the snapshot, or
    /// already imported by a concurrent pass.
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: &ReconcileReport) {
        self.imported += other.imported;
        self.updated += other.updated;
        self.cleaned += other.cleaned;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Kind a record's parent has, when it is not the scope itself.
fn parent_kind(kind: ResourceKind) -> Option<ResourceKind> {
    match kind {
        ResourceKind::Subnet | ResourceKind::Port => Some(ResourceKind::Network),
        ResourceKind::Volume => Some(ResourceKind::Instance),
        ResourceKind::Snapshot => Some(ResourceKind::Volume),
        _ => None,
    }
}

pub struct ReconciliationEngine {
    backend: Arc<dyn Backend>,
    store: Arc<dyn ResourceStore>,
    ledger: Arc<QuotaLedger>,
    events: EventSink,
}

impl ReconciliationEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<dyn ResourceStore>,
        ledger: Arc<QuotaLedger>,
        events: EventSink,
    ) -> Self {
        Self {
            backend,
            store,
            ledger,
            events,
        }
    }

    /// Reconcile `kind` across `scopes` with a single remote list call.
    ///
    /// Failures are isolated per scope and per record and only counted.
    pub async fn reconcile(
        &self,
        kind: ResourceKind,
        scopes: &[ScopeKey],
    ) -> Result<ReconcileReport, BackendError> {
        let mut report = ReconcileReport::default();
        if scopes.is_empty() {
            return Ok(report);
        }

        let started_at = Utc::now();
        let backend_ids: Vec<String> = scopes.iter().map(|s| s.backend_id.clone()).collect();
        let remote = self.backend.list(kind, &backend_ids).await?;

        let mut by_scope: HashMap<String, Vec<RemoteResource>> = HashMap::new();
        for item in remote {
            let key = item
                .scope_backend_id
                .clone()
                .or_else(|| (scopes.len() == 1).then(|| scopes[0].backend_id.clone()));
            match key {
                Some(key) => by_scope.entry(key).or_default().push(item),
                None => warn!(
                    kind = %kind,
                    backend_id = %item.backend_id,
                    "Remote object without scope in a multi-scope listing, ignoring"
                ),
            }
        }

        for scope in scopes {
            let remote = by_scope.remove(&scope.backend_id).unwrap_or_default();
            match self.reconcile_scope(kind, scope, remote, started_at).await {
                Ok(r) => report.merge(&r),
                Err(e) => {
                    warn!(kind = %kind, scope = %scope.scope, error = %e, "Reconciliation of scope failed");
                    report.failed += 1;
                }
            }
        }

        // Rules can only point at groups that exist locally, so this runs
        // after every scope's groups are in place.
        if kind == ResourceKind::SecurityGroup {
            for scope in scopes {
                if let Err(e) = self.repair_rule_associations(&scope.scope).await {
                    warn!(scope = %scope.scope, error = %e, "Security group rule repair failed");
                    report.failed += 1;
                }
            }
        }

        if kind == ResourceKind::Tenant {
            for scope in scopes {
                self.pull_scope_tenant_quotas(&scope.scope, &mut report).await;
            }
        }

        info!(
            kind = %kind,
            scopes = scopes.len(),
            imported = report.imported,
            updated = report.updated,
            cleaned = report.cleaned,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    async fn reconcile_scope(
        &self,
        kind: ResourceKind,
        scope: &ScopeKey,
        remote: Vec<RemoteResource>,
        started_at: DateTime<Utc>,
    ) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        let local = self.store.list(kind, &scope.scope).await?;
        let diff = diff_by_key(
            local,
            remote,
            |l: &ResourceRecord| l.backend_id.clone(),
            |r: &RemoteResource| r.backend_id.clone(),
        );
        debug!(
            kind = %kind,
            scope = %scope.scope,
            new = diff.new.len(),
            stale = diff.stale.len(),
            matching = diff.matching.len(),
            "Computed diff"
        );

        // new before stale, so a delete+recreate round trip keeps its record
        self.import(kind, scope, diff.new, &mut report).await?;
        for (local, remote) in diff.matching {
            if kind == ResourceKind::Tenant {
                // the hierarchy lives in memory, rebuild it on every pass
                quotas::register_tenant(&self.ledger, &local).await;
            }
            self.pull_matching(local, &remote, started_at, &mut report)
                .await;
        }
        for local in diff.stale {
            self.clean(local, &mut report).await;
        }

        Ok(report)
    }

    async fn import(
        &self,
        kind: ResourceKind,
        scope: &ScopeKey,
        remote: Vec<RemoteResource>,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        if remote.is_empty() {
            return Ok(());
        }

        let mut records = Vec::with_capacity(remote.len());
        for item in &remote {
            let parent_id = match (parent_kind(kind), &item.parent_backend_id) {
                (Some(pk), Some(pbid)) => self
                    .store
                    .find_by_backend_id(pk, &scope.scope, pbid)
                    .await?
                    .map(|p| p.id),
                (Some(_), None) => None,
                (None, _) if kind == ResourceKind::Tenant => None,
                (None, _) => Some(scope.scope.clone()),
            };
            records.push(ResourceRecord::imported(
                scope.scope.clone(),
                parent_id,
                item,
            ));
        }

        let result = self.store.import_batch(records).await?;
        for record in &result.duplicates {
            debug!(
                kind = %kind,
                backend_id = ?record.backend_id,
                "Already imported by another pass"
            );
        }
        report.skipped += result.duplicates.len();

        let imported = !result.inserted.is_empty();
        for record in result.inserted {
            if kind == ResourceKind::Tenant {
                quotas::register_tenant(&self.ledger, &record).await;
            }
            // the backend is authoritative for things that already exist
            if let Err(e) = quotas::reserve_all(&self.ledger, &[&record], false).await {
                warn!(resource_id = %record.id, error = %e, "Failed to account imported usage");
            }
            report.imported += 1;
            self.events.emit(Event::Imported(ResourceRef::from(&record))).await;
        }
        if imported {
            let charged = match kind {
                ResourceKind::Tenant => QuotaScope::project(scope.scope.clone()),
                _ => QuotaScope::tenant(scope.scope.clone()),
            };
            self.ledger.refresh_aggregates(&charged).await;
        }
        Ok(())
    }

    async fn pull_matching(
        &self,
        mut local: ResourceRecord,
        remote: &RemoteResource,
        started_at: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) {
        if !local.is_stable() {
            debug!(resource_id = %local.id, state = %local.state, "Skipping record mid-transition");
            report.skipped += 1;
            return;
        }

        let (changed, removed_rules) = match local.pull_from(remote, Some(started_at)) {
            PullOutcome::Stale => {
                debug!(resource_id = %local.id, "Record edited after snapshot, skipping");
                report.skipped += 1;
                return;
            }
            PullOutcome::Applied {
                changed,
                removed_rules,
            } => (changed, removed_rules),
        };
        if changed.is_empty() {
            return;
        }

        match self.store.update(local).await {
            Ok(saved) => {
                report.updated += 1;
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
            Err(StoreError::VersionMismatch { .. }) => {
                debug!(backend_id = %remote.backend_id, "Record changed during pull, skipping");
                report.skipped += 1;
            }
            Err(e) => {
                warn!(backend_id = %remote.backend_id, error = %e, "Failed to save pulled record");
                report.failed += 1;
            }
        }
    }

    /// Drop a record the backend no longer has.
    ///
    /// A tenant takes everything in its scope along. Other parents leave
    /// their children in place, detached, for their own kind's pass to judge.
    async fn clean(&self, local: ResourceRecord, report: &mut ReconcileReport) {
        if !local.is_stable() {
            // re-evaluated on the next pass
            report.skipped += 1;
            return;
        }

        let prepared = if local.kind() == ResourceKind::Tenant {
            self.clean_tenant_scope(&local, report).await
        } else {
            self.detach_children(&local).await.map(|()| true)
        };
        match prepared {
            Ok(true) => {}
            Ok(false) => {
                report.skipped += 1;
                return;
            }
            Err(e) => {
                warn!(resource_id = %local.id, error = %e, "Failed to prepare stale record for cleaning");
                report.failed += 1;
                return;
            }
        }

        self.drop_record(local, report).await;
    }

    /// Remove every record in a stale tenant's scope. Nothing is removed
    /// while one of them is mid-transition.
    async fn clean_tenant_scope(
        &self,
        tenant: &ResourceRecord,
        report: &mut ReconcileReport,
    ) -> Result<bool, StoreError> {
        let mut members = Vec::new();
        for kind in ResourceKind::ALL {
            if kind != ResourceKind::Tenant {
                members.extend(self.store.list(kind, &tenant.id).await?);
            }
        }
        if let Some(busy) = members.iter().find(|r| !r.is_stable()) {
            debug!(tenant_id = %tenant.id, resource_id = %busy.id, "Tenant scope busy, not cleaning yet");
            return Ok(false);
        }
        for member in members {
            self.drop_record(member, report).await;
        }
        Ok(true)
    }

    async fn detach_children(&self, parent: &ResourceRecord) -> Result<(), StoreError> {
        for mut child in self.store.list_children(&parent.id).await? {
            child.parent_id = None;
            let child = self.store.update(child).await?;
            debug!(resource_id = %child.id, parent_id = %parent.id, "Detached child of stale record");
        }
        Ok(())
    }

    async fn drop_record(&self, record: ResourceRecord, report: &mut ReconcileReport) {
        match self.store.delete(&record.id).await {
            Ok(_) => {
                quotas::release_all(&self.ledger, &record).await;
                if record.kind() == ResourceKind::Tenant {
                    quotas::forget_tenant(&self.ledger, &record).await;
                }
                report.cleaned += 1;
                self.events
                    .emit(Event::CleanedFromCache(ResourceRef::from(&record)))
                    .await;
            }
            Err(e) => {
                warn!(resource_id = %record.id, error = %e, "Failed to clean stale record");
                report.failed += 1;
            }
        }
    }

    /// Resolve each rule's remote group to the local group now known under
    /// that backend id. Returns the number of rules updated.
    pub async fn repair_rule_associations(&self, scope: &str) -> Result<usize, StoreError> {
        let groups = self.store.list(ResourceKind::SecurityGroup, scope).await?;
        let by_backend_id: HashMap<String, String> = groups
            .iter()
            .filter_map(|g| g.backend_id.clone().map(|bid| (bid, g.id.clone())))
            .collect();

        let mut repaired = 0;
        for mut group in groups {
            if !group.is_stable() {
                continue;
            }
            let ResourceSpec::SecurityGroup(spec) = &mut group.spec else {
                continue;
            };

            let mut changed = 0;
            for rule in &mut spec.rules {
                let resolved = rule
                    .remote_group_backend_id
                    .as_ref()
                    .and_then(|bid| by_backend_id.get(bid));
                if let Some(local_id) = resolved
                    && rule.remote_group_id.as_ref() != Some(local_id)
                {
                    rule.remote_group_id = Some(local_id.clone());
                    changed += 1;
                }
            }
            if changed == 0 {
                continue;
            }

            match self.store.update(group).await {
                Ok(_) => repaired += changed,
                Err(StoreError::VersionMismatch { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if repaired > 0 {
            debug!(scope, repaired, "Repaired security group rule associations");
        }
        Ok(repaired)
    }

    /// Overwrite ledger entries with backend-reported quotas.
    pub async fn apply_quotas(&self, scope: &QuotaScope, remote: &[RemoteQuota]) {
        apply_quotas(&self.ledger, scope, remote).await;
    }

    /// Fetch and apply the backend quotas of one tenant.
    pub async fn pull_tenant_quotas(&self, tenant: &ResourceRecord) -> Result<(), BackendError> {
        let output = self
            .backend
            .call(BackendMethod::PullTenantQuotas, tenant, &Value::Null)
            .await?;
        if let BackendOutput::Quotas(remote) = output {
            let scope = quotas::register_tenant(&self.ledger, tenant).await;
            self.apply_quotas(&scope, &remote).await;
            self.ledger.refresh_aggregates(&scope).await;
        }
        Ok(())
    }

    async fn pull_scope_tenant_quotas(&self, scope: &str, report: &mut ReconcileReport) {
        let tenants = match self.store.list(ResourceKind::Tenant, scope).await {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!(scope, error = %e, "Failed to list tenants for quota pull");
                report.failed += 1;
                return;
            }
        };
        for tenant in tenants
            .iter()
            .filter(|t| t.is_stable() && t.backend_id.is_some())
        {
            if let Err(e) = self.pull_tenant_quotas(tenant).await {
                warn!(tenant_id = %tenant.id, error = %e, "Failed to pull tenant quotas");
                report.failed += 1;
            }
        }
    }
}

/// Backend quotas are authoritative: limits and usage are written verbatim.
pub async fn apply_quotas(ledger: &QuotaLedger, scope: &QuotaScope, remote: &[RemoteQuota]) {
    for quota in remote {
        ledger.set_limit(scope, &quota.name, quota.limit).await;
        ledger.pull_usage(scope, &quota.name, quota.usage).await;
    }
    debug!(scope = %scope, quotas = remote.len(), "Applied backend quotas");
}
