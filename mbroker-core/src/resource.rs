//! Managed resource model.
//!
//! One envelope type, [`ResourceRecord`], carries the fields every resource
//! shares (identity, scope, lifecycle state, runtime state). The kind-specific
//! attributes live in [`ResourceSpec`], one struct per kind. Each kind declares
//! which of its fields are *backend fields*: the allow-list that a pull from
//! the remote side may overwrite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::remote::RemoteResource;
use crate::state::{self, InvalidTransition, ResourceState, Transition};

/// Local primary key.
pub type ResourceId = String;

/// Every kind of entity the broker manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Tenant,
    Network,
    Subnet,
    SecurityGroup,
    FloatingIp,
    Port,
    Router,
    ServerGroup,
    Volume,
    Instance,
    Snapshot,
    Backup,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::Tenant,
        ResourceKind::Network,
        ResourceKind::Subnet,
        ResourceKind::SecurityGroup,
        ResourceKind::FloatingIp,
        ResourceKind::Port,
        ResourceKind::Router,
        ResourceKind::ServerGroup,
        ResourceKind::Volume,
        ResourceKind::Instance,
        ResourceKind::Snapshot,
        ResourceKind::Backup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Tenant => "tenant",
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::FloatingIp => "floating_ip",
            ResourceKind::Port => "port",
            ResourceKind::Router => "router",
            ResourceKind::ServerGroup => "server_group",
            ResourceKind::Volume => "volume",
            ResourceKind::Instance => "instance",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::Backup => "backup",
        }
    }

    /// Fields whose local change must be pushed to the backend.
    ///
    /// Anything else (e.g. an instance description) is cosmetic and an
    /// update touching only such fields needs no backend call.
    pub fn update_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Tenant => &["name", "description"],
            ResourceKind::Network => &["name", "description", "mtu"],
            ResourceKind::Subnet => &[
                "name",
                "description",
                "gateway_ip",
                "allocation_pools",
                "enable_dhcp",
                "dns_nameservers",
            ],
            ResourceKind::SecurityGroup => &["name", "description", "rules"],
            ResourceKind::FloatingIp => &["description"],
            ResourceKind::Port => &["name"],
            ResourceKind::Router => &["name"],
            ResourceKind::ServerGroup => &[],
            ResourceKind::Volume => &["name", "description", "size_mb"],
            ResourceKind::Instance => &["name", "flavor_name", "security_group_ids"],
            ResourceKind::Snapshot => &["name", "description"],
            ResourceKind::Backup => &[],
        }
    }

    /// Kinds whose remote deletion completes asynchronously and must be
    /// confirmed by polling.
    pub fn deletes_asynchronously(&self) -> bool {
        matches!(
            self,
            ResourceKind::Tenant
                | ResourceKind::Instance
                | ResourceKind::Volume
                | ResourceKind::Snapshot
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind '{}'", s))
    }
}

/// Per-kind field bookkeeping.
pub trait BackendFields {
    /// Fields a pull may overwrite.
    const BACKEND: &'static [&'static str];

    /// Names of all fields (backend or local) that differ from `other`.
    fn diff(&self, other: &Self) -> Vec<&'static str>;

    /// Copy backend fields from `remote`, returning the ones that changed.
    fn pull_from(&mut self, remote: &Self) -> Vec<&'static str>;
}

macro_rules! backend_fields {
    ($ty:ty { backend: [$($b:ident),* $(,)?], local: [$($l:ident),* $(,)?] $(,)? }) => {
        impl BackendFields for $ty {
            const BACKEND: &'static [&'static str] = &[$(stringify!($b)),*];

            #[allow(unused_mut, unused_variables)]
            fn diff(&self, other: &Self) -> Vec<&'static str> {
                let mut changed = Vec::new();
                $(if self.$b != other.$b { changed.push(stringify!($b)); })*
                $(if self.$l != other.$l { changed.push(stringify!($l)); })*
                changed
            }

            #[allow(unused_mut, unused_variables)]
            fn pull_from(&mut self, remote: &Self) -> Vec<&'static str> {
                let mut changed = Vec::new();
                $(if self.$b != remote.$b {
                    self.$b = remote.$b.clone();
                    changed.push(stringify!($b));
                })*
                changed
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantSpec {
    pub availability_zone: String,
    /// Backend id of the tenant's internal network once created.
    pub internal_network_id: Option<String>,
    pub external_network_id: Option<String>,
    pub user_username: String,
    pub user_password: String,
}

backend_fields!(TenantSpec {
    backend: [availability_zone, internal_network_id, external_network_id],
    local: [user_username, user_password],
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub is_external: bool,
    pub network_type: String,
    pub segmentation_id: Option<u32>,
    pub mtu: Option<u32>,
}

backend_fields!(NetworkSpec {
    backend: [is_external, network_type, segmentation_id, mtu],
    local: [],
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub cidr: String,
    pub gateway_ip: Option<String>,
    pub allocation_pools: Vec<String>,
    pub ip_version: u8,
    pub enable_dhcp: bool,
    pub dns_nameservers: Vec<String>,
}

impl Default for SubnetSpec {
    fn default() -> Self {
        Self {
            cidr: "192.168.42.0/24".to_string(),
            gateway_ip: None,
            allocation_pools: Vec::new(),
            ip_version: 4,
            enable_dhcp: true,
            dns_nameservers: Vec::new(),
        }
    }
}

backend_fields!(SubnetSpec {
    backend: [cidr, gateway_ip, allocation_pools, ip_version, enable_dhcp, dns_nameservers],
    local: [],
});

/// One rule of a security group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroupRule {
    pub backend_id: Option<String>,
    pub direction: String,
    pub ethertype: String,
    pub protocol: Option<String>,
    pub from_port: Option<u16>,
    pub to_port: Option<u16>,
    pub cidr: Option<String>,
    pub description: String,
    /// Remote identifier of the group this rule refers to.
    pub remote_group_backend_id: Option<String>,
    /// Local group resolved from `remote_group_backend_id`; set by the
    /// association repair pass after groups are reconciled.
    pub remote_group_id: Option<ResourceId>,
}

impl SecurityGroupRule {
    /// Equal apart from identifiers.
    pub fn same_content(&self, other: &Self) -> bool {
        self.direction == other.direction
            && self.ethertype == other.ethertype
            && self.protocol == other.protocol
            && self.from_port == other.from_port
            && self.to_port == other.to_port
            && self.cidr == other.cidr
            && self.remote_group_backend_id == other.remote_group_backend_id
    }
}

impl PartialEq for SecurityGroupRule {
    // remote_group_id is a local association, not part of the remote rule
    fn eq(&self, other: &Self) -> bool {
        self.backend_id == other.backend_id
            && self.direction == other.direction
            && self.ethertype == other.ethertype
            && self.protocol == other.protocol
            && self.from_port == other.from_port
            && self.to_port == other.to_port
            && self.cidr == other.cidr
            && self.description == other.description
            && self.remote_group_backend_id == other.remote_group_backend_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    pub rules: Vec<SecurityGroupRule>,
}

/// Outcome of merging a remote rule list into a local one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleMerge {
    pub added: usize,
    pub updated: usize,
    pub removed: Vec<SecurityGroupRule>,
}

impl RuleMerge {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed.is_empty()
    }
}

impl SecurityGroupSpec {
    /// Reconcile rules by backend id. A local rule without a backend id has
    /// not been seen remotely yet: it adopts the first remote rule with the
    /// same content, otherwise it is kept. Local associations survive updates.
    pub fn merge_rules(&mut self, remote: &[SecurityGroupRule]) -> RuleMerge {
        let mut merge = RuleMerge::default();
        let mut merged = Vec::with_capacity(remote.len());
        let mut adopted = vec![false; self.rules.len()];

        for remote_rule in remote {
            let existing = self.rules.iter().find(|r| {
                r.backend_id.is_some() && r.backend_id == remote_rule.backend_id
            });
            match existing {
                Some(local) if local == remote_rule => merged.push(local.clone()),
                Some(local) => {
                    let mut rule = remote_rule.clone();
                    if rule.remote_group_backend_id == local.remote_group_backend_id {
                        rule.remote_group_id = local.remote_group_id.clone();
                    }
                    merge.updated += 1;
                    merged.push(rule);
                }
                None => {
                    let pending = self.rules.iter().enumerate().position(|(i, r)| {
                        !adopted[i] && r.backend_id.is_none() && r.same_content(remote_rule)
                    });
                    let mut rule = remote_rule.clone();
                    match pending {
                        Some(i) => {
                            adopted[i] = true;
                            rule.remote_group_id = self.rules[i].remote_group_id.clone();
                            merge.updated += 1;
                        }
                        None => merge.added += 1,
                    }
                    merged.push(rule);
                }
            }
        }

        for (i, local) in self.rules.drain(..).enumerate() {
            match &local.backend_id {
                None if !adopted[i] => merged.push(local),
                None => {}
                Some(id) => {
                    if !remote.iter().any(|r| r.backend_id.as_ref() == Some(id)) {
                        merge.removed.push(local);
                    }
                }
            }
        }

        self.rules = merged;
        merge
    }
}

impl BackendFields for SecurityGroupSpec {
    const BACKEND: &'static [&'static str] = &["rules"];

    fn diff(&self, other: &Self) -> Vec<&'static str> {
        if self.rules == other.rules {
            vec![]
        } else {
            vec!["rules"]
        }
    }

    fn pull_from(&mut self, remote: &Self) -> Vec<&'static str> {
        if self.merge_rules(&remote.rules).is_empty() {
            vec![]
        } else {
            vec!["rules"]
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloatingIpSpec {
    pub address: Option<String>,
    pub backend_network_id: String,
    pub port_backend_id: Option<String>,
}

backend_fields!(FloatingIpSpec {
    backend: [address, backend_network_id, port_backend_id],
    local: [],
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub mac_address: String,
    pub fixed_ips: Vec<String>,
    pub network_backend_id: Option<String>,
}

backend_fields!(PortSpec {
    backend: [mac_address, fixed_ips, network_backend_id],
    local: [],
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterSpec {
    pub fixed_ips: Vec<String>,
}

backend_fields!(RouterSpec {
    backend: [fixed_ips],
    local: [],
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerGroupSpec {
    pub policy: String,
}

backend_fields!(ServerGroupSpec {
    backend: [policy],
    local: [],
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub size_mb: u64,
    pub bootable: bool,
    pub volume_type: Option<String>,
    pub device: Option<String>,
    pub instance_backend_id: Option<String>,
    /// Image to build a bootable volume from.
    pub image_name: Option<String>,
}

backend_fields!(VolumeSpec {
    backend: [size_mb, bootable, volume_type, device, instance_backend_id],
    local: [image_name],
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub flavor_name: String,
    pub cores: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub image_name: String,
    pub external_ips: Vec<String>,
    pub internal_ips: Vec<String>,
    pub security_group_ids: Vec<ResourceId>,
    pub floating_ip_ids: Vec<ResourceId>,
    pub server_group_id: Option<ResourceId>,
}

backend_fields!(InstanceSpec {
    backend: [flavor_name, cores, ram_mb, disk_mb, image_name, external_ips, internal_ips],
    local: [security_group_ids, floating_ip_ids, server_group_id],
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub size_mb: u64,
    pub source_volume_backend_id: Option<String>,
}

backend_fields!(SnapshotSpec {
    backend: [size_mb, source_volume_backend_id],
    local: [],
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupSpec {
    pub instance_id: Option<ResourceId>,
    pub snapshot_ids: Vec<ResourceId>,
}

backend_fields!(BackupSpec {
    backend: [],
    local: [instance_id, snapshot_ids],
});

/// Kind-specific attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Tenant(TenantSpec),
    Network(NetworkSpec),
    Subnet(SubnetSpec),
    SecurityGroup(SecurityGroupSpec),
    FloatingIp(FloatingIpSpec),
    Port(PortSpec),
    Router(RouterSpec),
    ServerGroup(ServerGroupSpec),
    Volume(VolumeSpec),
    Instance(InstanceSpec),
    Snapshot(SnapshotSpec),
    Backup(BackupSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Tenant(_) => ResourceKind::Tenant,
            ResourceSpec::Network(_) => ResourceKind::Network,
            ResourceSpec::Subnet(_) => ResourceKind::Subnet,
            ResourceSpec::SecurityGroup(_) => ResourceKind::SecurityGroup,
            ResourceSpec::FloatingIp(_) => ResourceKind::FloatingIp,
            ResourceSpec::Port(_) => ResourceKind::Port,
            ResourceSpec::Router(_) => ResourceKind::Router,
            ResourceSpec::ServerGroup(_) => ResourceKind::ServerGroup,
            ResourceSpec::Volume(_) => ResourceKind::Volume,
            ResourceSpec::Instance(_) => ResourceKind::Instance,
            ResourceSpec::Snapshot(_) => ResourceKind::Snapshot,
            ResourceSpec::Backup(_) => ResourceKind::Backup,
        }
    }

    /// Backend fields of this kind, excluding the shared `name`/`description`.
    pub fn backend_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceSpec::Tenant(_) => TenantSpec::BACKEND,
            ResourceSpec::Network(_) => NetworkSpec::BACKEND,
            ResourceSpec::Subnet(_) => SubnetSpec::BACKEND,
            ResourceSpec::SecurityGroup(_) => SecurityGroupSpec::BACKEND,
            ResourceSpec::FloatingIp(_) => FloatingIpSpec::BACKEND,
            ResourceSpec::Port(_) => PortSpec::BACKEND,
            ResourceSpec::Router(_) => RouterSpec::BACKEND,
            ResourceSpec::ServerGroup(_) => ServerGroupSpec::BACKEND,
            ResourceSpec::Volume(_) => VolumeSpec::BACKEND,
            ResourceSpec::Instance(_) => InstanceSpec::BACKEND,
            ResourceSpec::Snapshot(_) => SnapshotSpec::BACKEND,
            ResourceSpec::Backup(_) => BackupSpec::BACKEND,
        }
    }

    /// All differing fields. Specs of different kinds differ in `kind`.
    pub fn diff(&self, other: &ResourceSpec) -> Vec<&'static str> {
        match (self, other) {
            (ResourceSpec::Tenant(a), ResourceSpec::Tenant(b)) => a.diff(b),
            (ResourceSpec::Network(a), ResourceSpec::Network(b)) => a.diff(b),
            (ResourceSpec::Subnet(a), ResourceSpec::Subnet(b)) => a.diff(b),
            (ResourceSpec::SecurityGroup(a), ResourceSpec::SecurityGroup(b)) => a.diff(b),
            (ResourceSpec::FloatingIp(a), ResourceSpec::FloatingIp(b)) => a.diff(b),
            (ResourceSpec::Port(a), ResourceSpec::Port(b)) => a.diff(b),
            (ResourceSpec::Router(a), ResourceSpec::Router(b)) => a.diff(b),
            (ResourceSpec::ServerGroup(a), ResourceSpec::ServerGroup(b)) => a.diff(b),
            (ResourceSpec::Volume(a), ResourceSpec::Volume(b)) => a.diff(b),
            (ResourceSpec::Instance(a), ResourceSpec::Instance(b)) => a.diff(b),
            (ResourceSpec::Snapshot(a), ResourceSpec::Snapshot(b)) => a.diff(b),
            (ResourceSpec::Backup(a), ResourceSpec::Backup(b)) => a.diff(b),
            _ => vec!["kind"],
        }
    }

    /// Copy backend fields from a remote spec of the same kind.
    ///
    /// Security-group rules removed remotely are returned so callers can
    /// record them before they disappear.
    fn pull_from(&mut self, remote: &ResourceSpec) -> (Vec<&'static str>, Vec<SecurityGroupRule>) {
        match (self, remote) {
            (ResourceSpec::SecurityGroup(a), ResourceSpec::SecurityGroup(b)) => {
                let merge = a.merge_rules(&b.rules);
                if merge.is_empty() {
                    (vec![], vec![])
                } else {
                    (vec!["rules"], merge.removed)
                }
            }
            (ResourceSpec::Tenant(a), ResourceSpec::Tenant(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::Network(a), ResourceSpec::Network(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::Subnet(a), ResourceSpec::Subnet(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::FloatingIp(a), ResourceSpec::FloatingIp(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::Port(a), ResourceSpec::Port(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::Router(a), ResourceSpec::Router(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::ServerGroup(a), ResourceSpec::ServerGroup(b)) => {
                (a.pull_from(b), vec![])
            }
            (ResourceSpec::Volume(a), ResourceSpec::Volume(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::Instance(a), ResourceSpec::Instance(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::Snapshot(a), ResourceSpec::Snapshot(b)) => (a.pull_from(b), vec![]),
            (ResourceSpec::Backup(a), ResourceSpec::Backup(b)) => (a.pull_from(b), vec![]),
            _ => (vec![], vec![]),
        }
    }
}

/// Uniform view over any managed resource.
pub trait Resource {
    fn id(&self) -> &str;
    fn kind(&self) -> ResourceKind;
    fn state(&self) -> ResourceState;
    fn runtime_state(&self) -> &str;
    fn backend_id(&self) -> Option<&str>;
    /// Every field a pull may overwrite, shared fields included.
    fn backend_fields(&self) -> Vec<&'static str>;
}

/// Result of projecting a remote representation onto a local record.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// Fields were copied; `changed` is empty when nothing differed.
    Applied {
        changed: Vec<&'static str>,
        removed_rules: Vec<SecurityGroupRule>,
    },
    /// The record was edited locally after the remote snapshot was taken.
    Stale,
}

/// A managed resource as persisted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    /// Backend scope owning the resource (tenant id, or settings/project pair).
    pub scope: String,
    pub parent_id: Option<ResourceId>,
    pub name: String,
    pub description: String,
    /// Remote identifier, assigned only after a successful create call.
    pub backend_id: Option<String>,
    pub state: ResourceState,
    pub runtime_state: String,
    /// Last backend error, shown while the resource is ERRED.
    pub error_message: Option<String>,
    pub spec: ResourceSpec,
    /// Optimistic concurrency token, bumped by every store update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Last local edit of the resource's fields. State changes and pulls do
    /// not touch it.
    pub modified_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// New local record in CREATION_SCHEDULED, before any remote call.
    pub fn new(scope: impl Into<String>, name: impl Into<String>, spec: ResourceSpec) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope: scope.into(),
            parent_id: None,
            name: name.into(),
            description: String::new(),
            backend_id: None,
            state: ResourceState::CreationScheduled,
            runtime_state: String::new(),
            error_message: None,
            spec,
            version: 0,
            created_at: now,
            modified_at: now,
        }
    }

    /// Record materialised from a remote object that already exists.
    pub fn imported(
        scope: impl Into<String>,
        parent_id: Option<ResourceId>,
        remote: &RemoteResource,
    ) -> Self {
        let mut record = Self::new(scope, remote.name.clone(), remote.spec.clone());
        record.parent_id = parent_id;
        record.description = remote.description.clone();
        record.backend_id = Some(remote.backend_id.clone());
        record.runtime_state = remote.runtime_state.clone();
        record.state = ResourceState::Ok;
        record
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    pub fn is_stable(&self) -> bool {
        self.state.is_stable()
    }

    /// Apply a state-machine transition in place.
    pub fn transition(&mut self, transition: Transition) -> Result<(), InvalidTransition> {
        match state::target(Some(self.state), transition) {
            Some(next) => {
                self.state = next;
                if next == ResourceState::Ok {
                    self.error_message = None;
                }
                Ok(())
            }
            None => Err(InvalidTransition {
                resource_id: self.id.clone(),
                from: Some(self.state),
                transition,
            }),
        }
    }

    /// Move to ERRED keeping the backend's message.
    pub fn set_erred(&mut self, message: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(Transition::SetErred)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Mark a local field edit.
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    /// Overwrite backend fields from a fresh remote representation.
    ///
    /// With `snapshot_at`, the pull is discarded when the record was edited
    /// locally after that instant, so a stale snapshot never clobbers a
    /// concurrent local change.
    pub fn pull_from(
        &mut self,
        remote: &RemoteResource,
        snapshot_at: Option<DateTime<Utc>>,
    ) -> PullOutcome {
        if snapshot_at.is_some_and(|at| self.modified_at > at) {
            return PullOutcome::Stale;
        }

        let mut changed = Vec::new();
        if self.name != remote.name {
            self.name = remote.name.clone();
            changed.push("name");
        }
        if self.description != remote.description {
            self.description = remote.description.clone();
            changed.push("description");
        }
        if self.runtime_state != remote.runtime_state {
            self.runtime_state = remote.runtime_state.clone();
            changed.push("runtime_state");
        }
        let (spec_changed, removed_rules) = self.spec.pull_from(&remote.spec);
        changed.extend(spec_changed);

        PullOutcome::Applied {
            changed,
            removed_rules,
        }
    }
}

impl Resource for ResourceRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    fn state(&self) -> ResourceState {
        self.state
    }

    fn runtime_state(&self) -> &str {
        &self.runtime_state
    }

    fn backend_id(&self) -> Option<&str> {
        self.backend_id.as_deref()
    }

    fn backend_fields(&self) -> Vec<&'static str> {
        let mut fields = vec!["name", "description", "runtime_state"];
        fields.extend_from_slice(self.spec.backend_fields());
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn remote_network(name: &str, mtu: Option<u32>) -> RemoteResource {
        RemoteResource::new(
            "net-backend-1",
            name,
            ResourceSpec::Network(NetworkSpec {
                mtu,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_new_record_is_creation_scheduled() {
        let record = ResourceRecord::new(
            "tenant-1",
            "net",
            ResourceSpec::Network(NetworkSpec::default()),
        );
        assert_eq!(record.state, ResourceState::CreationScheduled);
        assert!(record.backend_id.is_none());
        assert_eq!(record.kind(), ResourceKind::Network);
    }

    #[test]
    fn test_imported_record_is_ok() {
        let remote = remote_network("ext", Some(1500));
        let record = ResourceRecord::imported("tenant-1", None, &remote);
        assert_eq!(record.state, ResourceState::Ok);
        assert_eq!(record.backend_id.as_deref(), Some("net-backend-1"));
    }

    #[test]
    fn test_pull_overwrites_only_backend_fields() {
        let mut record = ResourceRecord::new(
            "tenant-1",
            "vm",
            ResourceSpec::Instance(InstanceSpec {
                flavor_name: "small".into(),
                security_group_ids: vec!["sg-local".into()],
                ..Default::default()
            }),
        );
        let remote = RemoteResource::new(
            "vm-1",
            "vm",
            ResourceSpec::Instance(InstanceSpec {
                flavor_name: "large".into(),
                ..Default::default()
            }),
        )
        .with_runtime_state("ACTIVE");

        let outcome = record.pull_from(&remote, None);
        assert_eq!(
            outcome,
            PullOutcome::Applied {
                changed: vec!["runtime_state", "flavor_name"],
                removed_rules: vec![],
            }
        );
        match &record.spec {
            ResourceSpec::Instance(spec) => {
                assert_eq!(spec.flavor_name, "large");
                // local-only field untouched
                assert_eq!(spec.security_group_ids, vec!["sg-local".to_string()]);
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[test]
    fn test_local_only_kind_never_pulls() {
        let mut local = BackupSpec {
            instance_id: Some("vm-local".into()),
            snapshot_ids: vec!["snap-1".into()],
        };
        let remote = BackupSpec::default();

        assert!(BackupSpec::BACKEND.is_empty());
        assert_eq!(local.diff(&remote), vec!["instance_id", "snapshot_ids"]);
        assert!(local.pull_from(&remote).is_empty());
        assert_eq!(local.instance_id.as_deref(), Some("vm-local"));
    }

    #[test]
    fn test_tenant_pull_skips_credentials() {
        let mut local = TenantSpec {
            availability_zone: "az-1".into(),
            user_username: "svc".into(),
            user_password: "secret".into(),
            ..Default::default()
        };
        let remote = TenantSpec {
            availability_zone: "az-2".into(),
            ..Default::default()
        };

        assert_eq!(local.pull_from(&remote), vec!["availability_zone"]);
        assert_eq!(local.availability_zone, "az-2");
        assert_eq!(local.user_password, "secret");
    }

    #[test]
    fn test_pull_guard_rejects_stale_snapshot() {
        let mut record = ResourceRecord::new(
            "tenant-1",
            "net",
            ResourceSpec::Network(NetworkSpec::default()),
        );
        let snapshot_at = record.modified_at - Duration::seconds(5);
        record.name = "renamed-locally".into();

        let outcome = record.pull_from(&remote_network("remote-name", None), Some(snapshot_at));
        assert_eq!(outcome, PullOutcome::Stale);
        assert_eq!(record.name, "renamed-locally");
    }

    #[test]
    fn test_pull_guard_accepts_fresh_snapshot() {
        let mut record = ResourceRecord::new(
            "tenant-1",
            "net",
            ResourceSpec::Network(NetworkSpec::default()),
        );
        let snapshot_at = record.modified_at + Duration::seconds(1);
        let outcome = record.pull_from(&remote_network("remote-name", Some(9000)), Some(snapshot_at));
        assert!(matches!(outcome, PullOutcome::Applied { .. }));
        assert_eq!(record.name, "remote-name");
    }

    #[test]
    fn test_rule_merge_keeps_local_association() {
        let rule = |id: &str, port: u16| SecurityGroupRule {
            backend_id: Some(id.into()),
            direction: "ingress".into(),
            ethertype: "IPv4".into(),
            protocol: Some("tcp".into()),
            from_port: Some(port),
            to_port: Some(port),
            remote_group_backend_id: Some("sg-remote".into()),
            ..Default::default()
        };
        let mut local = SecurityGroupSpec {
            rules: vec![rule("r1", 22), rule("r2", 80)],
        };
        local.rules[0].remote_group_id = Some("sg-local".into());

        let merge = local.merge_rules(&[rule("r1", 22), rule("r3", 443)]);
        assert_eq!(merge.added, 1);
        assert_eq!(merge.updated, 0);
        assert_eq!(merge.removed.len(), 1);
        assert_eq!(merge.removed[0].backend_id.as_deref(), Some("r2"));
        assert_eq!(local.rules.len(), 2);
        assert_eq!(local.rules[0].remote_group_id.as_deref(), Some("sg-local"));
    }

    #[test]
    fn test_rule_merge_keeps_unpushed_rules() {
        let mut local = SecurityGroupSpec {
            rules: vec![SecurityGroupRule {
                direction: "egress".into(),
                ..Default::default()
            }],
        };
        let merge = local.merge_rules(&[]);
        assert!(merge.is_empty());
        assert_eq!(local.rules.len(), 1);
    }

    #[test]
    fn test_rule_merge_adopts_pushed_rule() {
        let pending = SecurityGroupRule {
            direction: "ingress".into(),
            protocol: Some("tcp".into()),
            from_port: Some(22),
            to_port: Some(22),
            ..Default::default()
        };
        let mut local = SecurityGroupSpec {
            rules: vec![pending.clone()],
        };
        let pushed = SecurityGroupRule {
            backend_id: Some("r9".into()),
            ..pending
        };

        let merge = local.merge_rules(&[pushed]);
        assert_eq!(merge.added, 0);
        assert_eq!(merge.updated, 1);
        assert_eq!(local.rules.len(), 1);
        assert_eq!(local.rules[0].backend_id.as_deref(), Some("r9"));
    }

    #[test]
    fn test_kind_parse() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_spec_diff_reports_local_fields() {
        let a = ResourceSpec::Volume(VolumeSpec {
            size_mb: 1024,
            ..Default::default()
        });
        let b = ResourceSpec::Volume(VolumeSpec {
            size_mb: 2048,
            image_name: Some("debian".into()),
            ..Default::default()
        });
        assert_eq!(a.diff(&b), vec!["size_mb", "image_name"]);
    }
}
