//! Quota usage attributed to each resource.
//!
//! Usage is held for as long as the local record exists: reserved when a
//! create is requested (or added unvalidated on import) and released when
//! the record is deleted locally.

use mbroker_core::{QuotaExceeded, QuotaHold, QuotaLedger, QuotaScope, ResourceRecord, ResourceSpec};

/// Ledger scope charged for `record`.
pub fn scope_of(record: &ResourceRecord) -> QuotaScope {
    QuotaScope::tenant(record.scope.clone())
}

/// Ledger scope of a tenant's own quotas, linked under its project.
pub async fn register_tenant(ledger: &QuotaLedger, tenant: &ResourceRecord) -> QuotaScope {
    let scope = QuotaScope::tenant(tenant.id.clone());
    ledger
        .register_scope(scope.clone(), Some(QuotaScope::project(tenant.scope.clone())))
        .await;
    scope
}

/// Drop a deleted tenant's scope and re-sum its project's aggregates.
pub async fn forget_tenant(ledger: &QuotaLedger, tenant: &ResourceRecord) {
    ledger
        .remove_scope(&QuotaScope::tenant(tenant.id.clone()))
        .await;
    ledger
        .refresh_aggregates(&QuotaScope::project(tenant.scope.clone()))
        .await;
}

/// Quota names and amounts `record` consumes.
pub fn usage_of(record: &ResourceRecord) -> Vec<(&'static str, i64)> {
    match &record.spec {
        ResourceSpec::Instance(spec) => vec![
            ("instances", 1),
            ("cores", spec.cores as i64),
            ("ram", spec.ram_mb as i64),
        ],
        ResourceSpec::Volume(spec) => vec![("volumes", 1), ("storage", spec.size_mb as i64)],
        ResourceSpec::Snapshot(spec) => vec![("snapshots", 1), ("storage", spec.size_mb as i64)],
        ResourceSpec::FloatingIp(_) => vec![("floating_ip_count", 1)],
        ResourceSpec::SecurityGroup(spec) => vec![
            ("security_group_count", 1),
            ("security_group_rule_count", spec.rules.len() as i64),
        ],
        ResourceSpec::Network(_) => vec![("network_count", 1)],
        ResourceSpec::Subnet(_) => vec![("subnet_count", 1)],
        ResourceSpec::Port(_) => vec![("port_count", 1)],
        ResourceSpec::Router(_) => vec![("router_count", 1)],
        ResourceSpec::ServerGroup(_) => vec![("server_group_count", 1)],
        ResourceSpec::Tenant(_) | ResourceSpec::Backup(_) => vec![],
    }
}

/// Reserve everything the records need, all or nothing.
pub async fn reserve_all(
    ledger: &QuotaLedger,
    records: &[&ResourceRecord],
    validate: bool,
) -> Result<Vec<QuotaHold>, QuotaExceeded> {
    let requests: Vec<(QuotaScope, &str, i64)> = records
        .iter()
        .flat_map(|record| {
            let scope = scope_of(record);
            usage_of(record)
                .into_iter()
                .filter(|(_, delta)| *delta != 0)
                .map(move |(name, delta)| (scope.clone(), name, delta))
        })
        .collect();
    ledger.reserve_many(&requests, validate).await
}

/// Reserve the growth between two versions of a record.
///
/// Growth and shrinkage are applied in one ledger step. Only the growth is
/// returned as holds.
pub async fn reserve_growth(
    ledger: &QuotaLedger,
    before: &ResourceRecord,
    after: &ResourceRecord,
) -> Result<Vec<QuotaHold>, QuotaExceeded> {
    let scope = scope_of(after);
    let old = usage_of(before);
    let requests: Vec<(QuotaScope, &str, i64)> = usage_of(after)
        .into_iter()
        .map(|(name, amount)| {
            let previous = old
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, a)| *a)
                .unwrap_or(0);
            (scope.clone(), name, amount - previous)
        })
        .filter(|(_, _, delta)| *delta != 0)
        .collect();

    let holds = ledger.reserve_many(&requests, true).await?;
    Ok(holds.into_iter().filter(|hold| hold.delta > 0).collect())
}

/// Undo [`reserve_growth`] after the edit could not be saved.
pub async fn revert_growth(
    ledger: &QuotaLedger,
    before: &ResourceRecord,
    after: &ResourceRecord,
    holds: &[QuotaHold],
) -> Result<(), QuotaExceeded> {
    ledger.cancel_holds(holds).await;

    let scope = scope_of(before);
    let new = usage_of(after);
    let shrunk: Vec<(QuotaScope, &str, i64)> = usage_of(before)
        .into_iter()
        .filter_map(|(name, amount)| {
            let current = new
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, a)| *a)
                .unwrap_or(0);
            (amount > current).then(|| (scope.clone(), name, amount - current))
        })
        .collect();
    ledger.reserve_many(&shrunk, false).await?;
    Ok(())
}

/// Give back everything `record` held.
pub async fn release_all(ledger: &QuotaLedger, record: &ResourceRecord) {
    let scope = scope_of(record);
    let holds: Vec<QuotaHold> = usage_of(record)
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|(name, delta)| QuotaHold {
            scope: scope.clone(),
            name: name.to_string(),
            delta,
        })
        .collect();
    ledger.release_holds(&holds).await;
}
