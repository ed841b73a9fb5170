//! Hierarchical quota accounting.
//!
//! Quotas are `(scope, name) -> (limit, usage)` pairs. Scopes form a tree
//! (tenant -> project -> customer). A reservation on a scope also counts
//! against every ancestor that defines a quota of the same name, and is
//! committed only if all of them accept it.
//!
//! Validated reservations are provisional: they count as usage right away
//! but are also tracked as held until the request that took them settles.
//! Backend-reported usage never wipes out what is still held.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Customer,
    Project,
    Tenant,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Customer => "customer",
            ScopeKind::Project => "project",
            ScopeKind::Tenant => "tenant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaScope {
    pub kind: ScopeKind,
    pub id: String,
}

impl QuotaScope {
    pub fn new(kind: ScopeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn customer(id: impl Into<String>) -> Self {
        Self::new(ScopeKind::Customer, id)
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self::new(ScopeKind::Project, id)
    }

    pub fn tenant(id: impl Into<String>) -> Self {
        Self::new(ScopeKind::Tenant, id)
    }
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Limit and usage of one quota. A `None` limit is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub limit: Option<i64>,
    pub usage: i64,
    /// Part of `usage` reserved by requests still in flight.
    #[serde(default)]
    pub held: i64,
}

impl Quota {
    fn admits(&self, delta: i64) -> bool {
        self.limit.is_none_or(|limit| self.usage + delta <= limit)
    }
}

/// A reservation taken by a provisioning request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaHold {
    pub scope: QuotaScope,
    pub name: String,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("quota {name} exceeded on {scope}: usage {usage} + {requested} > limit {limit}")]
pub struct QuotaExceeded {
    pub scope: QuotaScope,
    pub name: String,
    pub limit: i64,
    pub usage: i64,
    pub requested: i64,
}

#[derive(Default)]
struct LedgerInner {
    quotas: HashMap<(QuotaScope, String), Quota>,
    parents: HashMap<QuotaScope, QuotaScope>,
    /// `(scope kind, name) -> child quota name` for aggregated quotas.
    aggregates: HashMap<(ScopeKind, String), String>,
}

impl LedgerInner {
    fn chain(&self, scope: &QuotaScope) -> Vec<QuotaScope> {
        let mut chain = vec![scope.clone()];
        let mut current = scope;
        while let Some(parent) = self.parents.get(current) {
            // guard against a misregistered cycle
            if chain.contains(parent) {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        chain
    }

    fn recompute(&mut self, scope: &QuotaScope, name: &str) -> i64 {
        let child_name = self
            .aggregates
            .get(&(scope.kind, name.to_string()))
            .cloned()
            .unwrap_or_else(|| name.to_string());

        let total: i64 = self
            .parents
            .iter()
            .filter(|(_, parent)| *parent == scope)
            .filter_map(|(child, _)| self.quotas.get(&(child.clone(), child_name.clone())))
            .map(|q| q.usage)
            .sum();

        self.quotas
            .entry((scope.clone(), name.to_string()))
            .or_default()
            .usage = total;
        total
    }

    fn is_aggregate(&self, scope: &QuotaScope, name: &str) -> bool {
        self.aggregates
            .contains_key(&(scope.kind, name.to_string()))
    }
}

/// Shared quota ledger.
///
/// Every mutation runs under one lock covering the whole
/// validate-then-commit sequence, so concurrent chains cannot lose updates.
#[derive(Default)]
pub struct QuotaLedger {
    inner: Mutex<LedgerInner>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `scope` under `parent` in the hierarchy.
    pub async fn register_scope(&self, scope: QuotaScope, parent: Option<QuotaScope>) {
        let mut inner = self.inner.lock().await;
        match parent {
            Some(parent) => {
                inner.parents.insert(scope, parent);
            }
            None => {
                inner.parents.remove(&scope);
            }
        }
    }

    /// Drop `scope` from the hierarchy together with its quotas.
    pub async fn remove_scope(&self, scope: &QuotaScope) {
        let mut inner = self.inner.lock().await;
        inner.parents.remove(scope);
        inner.quotas.retain(|(s, _), _| s != scope);
        debug!(scope = %scope, "Quota scope removed");
    }

    /// Declare that quota `name` on scopes of `kind` sums `child_name` over
    /// the scope's children.
    pub async fn register_aggregate(&self, kind: ScopeKind, name: &str, child_name: &str) {
        self.inner
            .lock()
            .await
            .aggregates
            .insert((kind, name.to_string()), child_name.to_string());
    }

    pub async fn set_limit(&self, scope: &QuotaScope, name: &str, limit: Option<i64>) {
        let mut inner = self.inner.lock().await;
        inner
            .quotas
            .entry((scope.clone(), name.to_string()))
            .or_default()
            .limit = limit;
    }

    pub async fn get(&self, scope: &QuotaScope, name: &str) -> Option<Quota> {
        self.inner
            .lock()
            .await
            .quotas
            .get(&(scope.clone(), name.to_string()))
            .copied()
    }

    pub async fn usage(&self, scope: &QuotaScope, name: &str) -> i64 {
        self.get(scope, name).await.map(|q| q.usage).unwrap_or(0)
    }

    /// Add `delta` to `name` on `scope` and every ancestor defining it.
    ///
    /// With `validate`, every affected limit is checked before anything is
    /// written; one rejection leaves the whole chain untouched.
    pub async fn reserve(
        &self,
        scope: &QuotaScope,
        name: &str,
        delta: i64,
        validate: bool,
    ) -> Result<QuotaHold, QuotaExceeded> {
        let mut holds = self
            .reserve_many(&[(scope.clone(), name, delta)], validate)
            .await?;
        Ok(holds.remove(0))
    }

    /// Apply several reservations as one unit.
    ///
    /// Validation and commit run under a single lock acquisition. Entries
    /// hitting the same quota are validated against their running sum, and
    /// one rejection commits nothing. Negative deltas give usage back and
    /// are never rejected. With `validate`, positive deltas stay held until
    /// [`confirm_holds`](Self::confirm_holds) or
    /// [`cancel_holds`](Self::cancel_holds).
    pub async fn reserve_many(
        &self,
        requests: &[(QuotaScope, &str, i64)],
        validate: bool,
    ) -> Result<Vec<QuotaHold>, QuotaExceeded> {
        let mut inner = self.inner.lock().await;
        // (usage delta, held delta) per affected quota
        let mut staged: HashMap<(QuotaScope, String), (i64, i64)> = HashMap::new();
        let mut holds = Vec::with_capacity(requests.len());

        for (scope, name, delta) in requests {
            for (depth, s) in inner.chain(scope).into_iter().enumerate() {
                if inner.is_aggregate(&s, name) {
                    continue;
                }
                let key = (s, name.to_string());
                let quota = match inner.quotas.get(&key) {
                    Some(q) => *q,
                    // the requested scope always tracks usage, ancestors only
                    // if they define the quota
                    None if depth == 0 => Quota::default(),
                    None => continue,
                };
                let pending = staged.get(&key).map(|(usage, _)| *usage).unwrap_or(0);
                if validate && *delta > 0 && !quota.admits(pending + delta) {
                    let (scope, name) = key;
                    return Err(QuotaExceeded {
                        scope,
                        name,
                        limit: quota.limit.unwrap_or_default(),
                        usage: quota.usage + pending,
                        requested: *delta,
                    });
                }
                let entry = staged.entry(key).or_default();
                entry.0 += delta;
                if validate && *delta > 0 {
                    entry.1 += delta;
                }
            }
            holds.push(QuotaHold {
                scope: scope.clone(),
                name: name.to_string(),
                delta: *delta,
            });
        }

        for (key, (delta, held)) in staged {
            let quota = inner.quotas.entry(key).or_default();
            quota.usage = (quota.usage + delta).max(0);
            quota.held += held;
        }
        for hold in &holds {
            debug!(scope = %hold.scope, quota = %hold.name, delta = hold.delta, "Quota reserved");
        }
        Ok(holds)
    }

    /// Subtract `delta` from `name` along the ancestor chain, never going
    /// below zero.
    pub async fn release(&self, scope: &QuotaScope, name: &str, delta: i64) {
        self.release_holds(&[QuotaHold {
            scope: scope.clone(),
            name: name.to_string(),
            delta,
        }])
        .await;
    }

    /// Give back several holds under one lock acquisition.
    pub async fn release_holds(&self, holds: &[QuotaHold]) {
        let mut inner = self.inner.lock().await;
        for hold in holds {
            for s in inner.chain(&hold.scope) {
                if inner.is_aggregate(&s, &hold.name) {
                    continue;
                }
                if let Some(quota) = inner.quotas.get_mut(&(s, hold.name.clone())) {
                    quota.usage = (quota.usage - hold.delta).max(0);
                }
            }
            debug!(scope = %hold.scope, quota = %hold.name, delta = hold.delta, "Quota released");
        }
    }

    /// Turn held usage into confirmed usage. Usage itself is unchanged.
    pub async fn confirm_holds(&self, holds: &[QuotaHold]) {
        self.settle(holds, false).await;
    }

    /// Undo provisional holds: usage and held both shrink by the hold.
    pub async fn cancel_holds(&self, holds: &[QuotaHold]) {
        self.settle(holds, true).await;
    }

    async fn settle(&self, holds: &[QuotaHold], cancel: bool) {
        let mut inner = self.inner.lock().await;
        for hold in holds.iter().filter(|h| h.delta > 0) {
            for s in inner.chain(&hold.scope) {
                if inner.is_aggregate(&s, &hold.name) {
                    continue;
                }
                if let Some(quota) = inner.quotas.get_mut(&(s, hold.name.clone())) {
                    quota.held = (quota.held - hold.delta).max(0);
                    if cancel {
                        quota.usage = (quota.usage - hold.delta).max(0);
                    }
                }
            }
            debug!(scope = %hold.scope, quota = %hold.name, delta = hold.delta, cancel, "Quota hold settled");
        }
    }

    /// Overwrite usage with a backend-reported value, bypassing validation.
    /// Amounts still held are added on top, the backend does not know them
    /// yet.
    pub async fn pull_usage(&self, scope: &QuotaScope, name: &str, usage: i64) {
        let mut inner = self.inner.lock().await;
        let quota = inner
            .quotas
            .entry((scope.clone(), name.to_string()))
            .or_default();
        quota.usage = usage + quota.held;
    }

    /// Re-sum an aggregated quota from the scope's children and overwrite it.
    pub async fn recompute_aggregate(&self, scope: &QuotaScope, name: &str) -> i64 {
        self.inner.lock().await.recompute(scope, name)
    }

    /// Recompute every aggregate defined on `scope` and its ancestors,
    /// nearest first.
    pub async fn refresh_aggregates(&self, scope: &QuotaScope) {
        let mut inner = self.inner.lock().await;
        for ancestor in inner.chain(scope) {
            let names: Vec<String> = inner
                .aggregates
                .keys()
                .filter(|(kind, _)| *kind == ancestor.kind)
                .map(|(_, name)| name.clone())
                .collect();
            for name in names {
                let total = inner.recompute(&ancestor, &name);
                debug!(scope = %ancestor, quota = %name, total, "Aggregate quota recomputed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn ledger() -> QuotaLedger {
        let ledger = QuotaLedger::new();
        ledger
            .register_scope(QuotaScope::project("p1"), Some(QuotaScope::customer("c1")))
            .await;
        ledger
            .register_scope(QuotaScope::tenant("t1"), Some(QuotaScope::project("p1")))
            .await;
        ledger
    }

    #[tokio::test]
    async fn test_reserve_propagates_to_ancestors() {
        let ledger = ledger().await;
        ledger.set_limit(&QuotaScope::project("p1"), "cores", Some(10)).await;
        ledger.set_limit(&QuotaScope::customer("c1"), "cores", Some(20)).await;

        ledger
            .reserve(&QuotaScope::tenant("t1"), "cores", 4, true)
            .await
            .unwrap();

        assert_eq!(ledger.usage(&QuotaScope::tenant("t1"), "cores").await, 4);
        assert_eq!(ledger.usage(&QuotaScope::project("p1"), "cores").await, 4);
        assert_eq!(ledger.usage(&QuotaScope::customer("c1"), "cores").await, 4);
    }

    #[tokio::test]
    async fn test_ancestor_rejection_rolls_back_everything() {
        let ledger = ledger().await;
        ledger.set_limit(&QuotaScope::tenant("t1"), "cores", Some(100)).await;
        ledger.set_limit(&QuotaScope::project("p1"), "cores", Some(100)).await;
        ledger.set_limit(&QuotaScope::customer("c1"), "cores", Some(5)).await;

        let err = ledger
            .reserve(&QuotaScope::tenant("t1"), "cores", 6, true)
            .await
            .unwrap_err();
        assert_eq!(err.scope, QuotaScope::customer("c1"));

        for scope in [
            QuotaScope::tenant("t1"),
            QuotaScope::project("p1"),
            QuotaScope::customer("c1"),
        ] {
            assert_eq!(ledger.usage(&scope, "cores").await, 0, "{}", scope);
        }
    }

    #[tokio::test]
    async fn test_usage_never_exceeds_limit() {
        let ledger = ledger().await;
        let tenant = QuotaScope::tenant("t1");
        ledger.set_limit(&tenant, "ram", Some(10)).await;

        let deltas = [3, 4, 5, 2, -1, 6, 1, 1];
        for delta in deltas {
            let before = ledger.usage(&tenant, "ram").await;
            if delta < 0 {
                ledger.release(&tenant, "ram", -delta).await;
            } else if ledger.reserve(&tenant, "ram", delta, true).await.is_err() {
                assert_eq!(ledger.usage(&tenant, "ram").await, before);
            }
            assert!(ledger.usage(&tenant, "ram").await <= 10);
        }
    }

    #[tokio::test]
    async fn test_batch_validates_running_sum() {
        let ledger = ledger().await;
        let tenant = QuotaScope::tenant("t1");
        ledger.set_limit(&QuotaScope::project("p1"), "storage", Some(1000)).await;

        let err = ledger
            .reserve_many(
                &[
                    (tenant.clone(), "volumes", 1),
                    (tenant.clone(), "storage", 600),
                    (tenant.clone(), "storage", 600),
                ],
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.scope, QuotaScope::project("p1"));
        assert_eq!(err.usage, 600);
        assert_eq!(ledger.usage(&tenant, "volumes").await, 0);
        assert_eq!(ledger.usage(&tenant, "storage").await, 0);

        let holds = ledger
            .reserve_many(
                &[(tenant.clone(), "storage", 600), (tenant.clone(), "storage", 400)],
                true,
            )
            .await
            .unwrap();
        assert_eq!(holds.len(), 2);
        assert_eq!(ledger.usage(&QuotaScope::project("p1"), "storage").await, 1000);

        ledger.release_holds(&holds).await;
        assert_eq!(ledger.usage(&tenant, "storage").await, 0);
        assert_eq!(ledger.usage(&QuotaScope::project("p1"), "storage").await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_batches_never_see_partial_usage() {
        let ledger = Arc::new(ledger().await);
        let project = QuotaScope::project("p1");
        ledger.set_limit(&project, "instances", Some(3)).await;
        ledger.set_limit(&project, "cores", Some(4)).await;

        // every batch fits the instance limit, only two fit the core limit
        let mut handles = Vec::new();
        for _ in 0..6 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let tenant = QuotaScope::tenant("t1");
                ledger
                    .reserve_many(&[(tenant.clone(), "instances", 1), (tenant, "cores", 2)], true)
                    .await
                    .is_ok()
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(ledger.usage(&project, "instances").await, 2);
        assert_eq!(ledger.usage(&project, "cores").await, 4);
    }

    #[tokio::test]
    async fn test_release_clamps_at_zero() {
        let ledger = ledger().await;
        let tenant = QuotaScope::tenant("t1");
        ledger.reserve(&tenant, "volumes", 1, true).await.unwrap();
        ledger.release(&tenant, "volumes", 5).await;
        assert_eq!(ledger.usage(&tenant, "volumes").await, 0);
    }

    #[tokio::test]
    async fn test_pull_usage_bypasses_limit() {
        let ledger = ledger().await;
        let tenant = QuotaScope::tenant("t1");
        ledger.set_limit(&tenant, "floating_ips", Some(2)).await;
        ledger.pull_usage(&tenant, "floating_ips", 7).await;
        let quota = ledger.get(&tenant, "floating_ips").await.unwrap();
        assert_eq!(quota.usage, 7);
        assert_eq!(quota.limit, Some(2));
    }

    #[tokio::test]
    async fn test_held_usage_survives_backend_pull() {
        let ledger = ledger().await;
        let tenant = QuotaScope::tenant("t1");
        ledger.set_limit(&tenant, "cores", Some(16)).await;

        let holds = ledger
            .reserve_many(&[(tenant.clone(), "cores", 4)], true)
            .await
            .unwrap();
        ledger.pull_usage(&tenant, "cores", 2).await;
        let quota = ledger.get(&tenant, "cores").await.unwrap();
        assert_eq!(quota.usage, 6);
        assert_eq!(quota.held, 4);

        ledger.confirm_holds(&holds).await;
        let quota = ledger.get(&tenant, "cores").await.unwrap();
        assert_eq!(quota.usage, 6);
        assert_eq!(quota.held, 0);

        // once confirmed the backend count is taken as is
        ledger.pull_usage(&tenant, "cores", 6).await;
        assert_eq!(ledger.usage(&tenant, "cores").await, 6);
    }

    #[tokio::test]
    async fn test_cancel_undoes_provisional_usage() {
        let ledger = ledger().await;
        let tenant = QuotaScope::tenant("t1");
        let project = QuotaScope::project("p1");
        ledger.set_limit(&project, "ram", Some(4096)).await;

        let holds = ledger
            .reserve_many(&[(tenant.clone(), "ram", 2048)], true)
            .await
            .unwrap();
        assert_eq!(ledger.get(&project, "ram").await.unwrap().held, 2048);

        ledger.cancel_holds(&holds).await;
        for scope in [&tenant, &project] {
            let quota = ledger.get(scope, "ram").await.unwrap();
            assert_eq!((quota.usage, quota.held), (0, 0), "{}", scope);
        }
    }

    #[tokio::test]
    async fn test_unvalidated_reservation_is_not_held() {
        let ledger = ledger().await;
        let tenant = QuotaScope::tenant("t1");
        ledger
            .reserve_many(&[(tenant.clone(), "volumes", 3)], false)
            .await
            .unwrap();
        let quota = ledger.get(&tenant, "volumes").await.unwrap();
        assert_eq!((quota.usage, quota.held), (3, 0));
    }

    #[tokio::test]
    async fn test_recompute_aggregate() {
        let ledger = ledger().await;
        ledger
            .register_scope(QuotaScope::tenant("t2"), Some(QuotaScope::project("p1")))
            .await;
        ledger
            .register_aggregate(ScopeKind::Project, "os_cpu_count", "cores")
            .await;

        ledger.pull_usage(&QuotaScope::tenant("t1"), "cores", 3).await;
        ledger.pull_usage(&QuotaScope::tenant("t2"), "cores", 5).await;

        let total = ledger
            .recompute_aggregate(&QuotaScope::project("p1"), "os_cpu_count")
            .await;
        assert_eq!(total, 8);
        assert_eq!(
            ledger.usage(&QuotaScope::project("p1"), "os_cpu_count").await,
            8
        );
    }

    #[tokio::test]
    async fn test_refresh_aggregates_walks_ancestors() {
        let ledger = ledger().await;
        ledger
            .register_aggregate(ScopeKind::Project, "os_cpu_count", "cores")
            .await;
        ledger
            .register_aggregate(ScopeKind::Customer, "project_cpu_count", "os_cpu_count")
            .await;

        ledger.pull_usage(&QuotaScope::tenant("t1"), "cores", 6).await;
        ledger.refresh_aggregates(&QuotaScope::tenant("t1")).await;

        assert_eq!(
            ledger.usage(&QuotaScope::project("p1"), "os_cpu_count").await,
            6
        );
        assert_eq!(
            ledger.usage(&QuotaScope::customer("c1"), "project_cpu_count").await,
            6
        );

        ledger.remove_scope(&QuotaScope::tenant("t1")).await;
        assert_eq!(
            ledger
                .recompute_aggregate(&QuotaScope::project("p1"), "os_cpu_count")
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_concurrent_reservations_respect_limit() {
        let ledger = Arc::new(ledger().await);
        let project = QuotaScope::project("p1");
        ledger.set_limit(&project, "instances", Some(5)).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .reserve(&QuotaScope::tenant("t1"), "instances", 1, true)
                    .await
                    .is_ok()
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);
        assert_eq!(ledger.usage(&project, "instances").await, 5);
    }
}
