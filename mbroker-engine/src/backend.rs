//! Seam to the remote cloud API.
//!
//! The engine never talks to a concrete cloud client. Every call goes
//! through [`Backend`], named by [`BackendMethod`] and failing with the
//! normalised [`BackendError`].

use async_trait::async_trait;
use mbroker_core::{BackendError, RemoteResource, ResourceKind, ResourceRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Typed name of a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendMethod {
    Create(ResourceKind),
    Update(ResourceKind),
    Delete(ResourceKind),
    Pull(ResourceKind),
    AddAdminUserToTenant,
    CreateTenantUser,
    PushTenantQuotas,
    PullTenantQuotas,
    ConnectTenantToExternalNetwork,
    SetSecurityGroupRules,
    UpdateInstanceSecurityGroups,
    AssignFloatingIp,
    ExtendVolume,
    DetachVolume,
    ResizeInstance,
}

impl BackendMethod {
    pub fn name(&self) -> String {
        match self {
            BackendMethod::Create(kind) => format!("create_{}", kind),
            BackendMethod::Update(kind) => format!("update_{}", kind),
            BackendMethod::Delete(kind) => format!("delete_{}", kind),
            BackendMethod::Pull(kind) => format!("pull_{}", kind),
            BackendMethod::AddAdminUserToTenant => "add_admin_user_to_tenant".into(),
            BackendMethod::CreateTenantUser => "create_tenant_user".into(),
            BackendMethod::PushTenantQuotas => "push_tenant_quotas".into(),
            BackendMethod::PullTenantQuotas => "pull_tenant_quotas".into(),
            BackendMethod::ConnectTenantToExternalNetwork => {
                "connect_tenant_to_external_network".into()
            }
            BackendMethod::SetSecurityGroupRules => "set_security_group_rules".into(),
            BackendMethod::UpdateInstanceSecurityGroups => {
                "update_instance_security_groups".into()
            }
            BackendMethod::AssignFloatingIp => "assign_floating_ip".into(),
            BackendMethod::ExtendVolume => "extend_volume".into(),
            BackendMethod::DetachVolume => "detach_volume".into(),
            BackendMethod::ResizeInstance => "resize_instance".into(),
        }
    }

    /// Deleting something already gone counts as success.
    pub fn is_delete(&self) -> bool {
        matches!(self, BackendMethod::Delete(_))
    }
}

impl fmt::Display for BackendMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Quota pair as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteQuota {
    pub name: String,
    pub limit: Option<i64>,
    pub usage: i64,
}

/// Payload of a successful backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOutput {
    Done,
    /// A remote object now exists.
    Created {
        backend_id: String,
        runtime_state: Option<String>,
    },
    /// Fresh remote representation of the target resource.
    Remote(RemoteResource),
    Quotas(Vec<RemoteQuota>),
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Call `method` on behalf of `resource`.
    async fn call(
        &self,
        method: BackendMethod,
        resource: &ResourceRecord,
        args: &Value,
    ) -> Result<BackendOutput, BackendError>;

    /// List every remote object of `kind` owned by any of the given scopes,
    /// in one request.
    async fn list(
        &self,
        kind: ResourceKind,
        scope_backend_ids: &[String],
    ) -> Result<Vec<RemoteResource>, BackendError>;
}
