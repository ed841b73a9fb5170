//! Core model of the resource broker: resources, lifecycle state machine,
//! quota ledger, reconciliation diff, events and persistence.

pub mod audit;
pub mod changes;
pub mod config;
pub mod diff;
pub mod error;
pub mod event;
pub mod permission;
pub mod quota;
pub mod remote;
pub mod resource;
pub mod state;
pub mod store;

pub use audit::{BrokerAuditLogger, create_audit_logger};
pub use changes::ChangedFields;
pub use config::{BrokerConfig, ConfigError, DefaultSecurityGroup, PollDefaults};
pub use diff::{Diff, diff_by_key};
pub use error::{CoreError, Result};
pub use event::{Event, EventSink, ResourceRef};
pub use permission::{LocalProject, ProjectPermission, ProjectRole};
pub use quota::{Quota, QuotaExceeded, QuotaHold, QuotaLedger, QuotaScope, ScopeKind};
pub use remote::{BackendError, BackendErrorKind, RemoteResource};
pub use resource::{
    BackupSpec, FloatingIpSpec, InstanceSpec, NetworkSpec, PortSpec, PullOutcome, Resource,
    ResourceId, ResourceKind, ResourceRecord, ResourceSpec, RouterSpec, RuleMerge,
    SecurityGroupRule, SecurityGroupSpec, ServerGroupSpec, SnapshotSpec, SubnetSpec, TenantSpec,
    VolumeSpec,
};
pub use state::{InvalidTransition, ResourceState, Transition};
pub use store::{
    ImportBatchResult, MemoryStore, PermissionStore, ResourceStore, SqliteStore, StoreError,
};
