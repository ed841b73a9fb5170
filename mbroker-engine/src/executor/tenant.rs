//! Tenant chains: a tenant comes with its internal network, subnet and
//! optionally default security groups, and takes everything in its scope
//! with it on deletion.

use mbroker_core::{
    BrokerConfig, CoreError, NetworkSpec, ResourceKind, ResourceRecord, ResourceSpec,
    ResourceState, SecurityGroupSpec, SubnetSpec, Transition,
};
use serde_json::json;

use super::{CreateOptions, Executor};
use crate::backend::BackendMethod;
use crate::chain::{Operation, TaskChain};
use crate::task::Task;

/// Tenant sub-resources are removed in this order, dependents first.
const DELETE_ORDER: [ResourceKind; 11] = [
    ResourceKind::Backup,
    ResourceKind::Snapshot,
    ResourceKind::Instance,
    ResourceKind::Volume,
    ResourceKind::FloatingIp,
    ResourceKind::Port,
    ResourceKind::Router,
    ResourceKind::ServerGroup,
    ResourceKind::SecurityGroup,
    ResourceKind::Subnet,
    ResourceKind::Network,
];

/// Local records a new tenant needs, all in CREATION_SCHEDULED.
pub(super) fn materialize_children(
    tenant: &ResourceRecord,
    options: &CreateOptions,
    config: &BrokerConfig,
) -> Vec<ResourceRecord> {
    let network = ResourceRecord::new(
        tenant.id.clone(),
        format!("{}-int-net", tenant.name),
        ResourceSpec::Network(NetworkSpec::default()),
    )
    .with_parent(tenant.id.clone());

    let subnet = ResourceRecord::new(
        tenant.id.clone(),
        format!("{}-sub-net", tenant.name),
        ResourceSpec::Subnet(SubnetSpec {
            cidr: config.internal_subnet_cidr.clone(),
            ..Default::default()
        }),
    )
    .with_parent(network.id.clone());

    let mut children = vec![network, subnet];
    if options.pull_security_groups {
        children.extend(config.default_security_groups.iter().map(|group| {
            ResourceRecord::new(
                tenant.id.clone(),
                group.name.clone(),
                ResourceSpec::SecurityGroup(SecurityGroupSpec {
                    rules: group.rules.clone(),
                }),
            )
            .with_parent(tenant.id.clone())
            .with_description(group.description.clone())
        }));
    }
    children
}

/// Create a child remotely, moving it to CREATING once it exists.
fn create_child(child: &ResourceRecord) -> Task {
    Task::backend(&child.id, BackendMethod::Create(child.kind()))
        .requires(ResourceState::CreationScheduled)
        .then(Transition::BeginCreating)
}

impl Executor {
    pub(super) async fn plan_tenant_create(
        &self,
        tenant: &ResourceRecord,
        options: &CreateOptions,
    ) -> Result<TaskChain, CoreError> {
        let mut networks = Vec::new();
        let mut subnets = Vec::new();
        let mut groups = Vec::new();
        for child in self.store.list_children(&tenant.id).await? {
            match child.kind() {
                ResourceKind::Network => {
                    subnets.extend(
                        self.store
                            .list_children(&child.id)
                            .await?
                            .into_iter()
                            .filter(|c| c.kind() == ResourceKind::Subnet),
                    );
                    networks.push(child);
                }
                ResourceKind::SecurityGroup => groups.push(child),
                _ => {}
            }
        }

        let id = tenant.id.as_str();
        let mut chain = TaskChain::new(id, Operation::Create);
        chain
            .push(Task::transition(id, Transition::BeginCreating).requires(ResourceState::CreationScheduled))
            .push(Task::backend(id, BackendMethod::Create(ResourceKind::Tenant)))
            .push(Task::backend(id, BackendMethod::AddAdminUserToTenant))
            .push(Task::backend(id, BackendMethod::CreateTenantUser));
        chain.extend(networks.iter().map(create_child));
        chain.extend(subnets.iter().map(create_child));
        chain.push(Task::backend(id, BackendMethod::PushTenantQuotas));

        if !options.skip_external_network
            && let Some(external) = &self.config.external_network_id
        {
            chain
                .push(Task::backend_with_args(
                    id,
                    BackendMethod::ConnectTenantToExternalNetwork,
                    json!({ "external_network_id": external }),
                ))
                .push(Task::reconcile(id, ResourceKind::FloatingIp));
        }

        if options.pull_security_groups {
            for group in &groups {
                chain.push(create_child(group));
                if let ResourceSpec::SecurityGroup(spec) = &group.spec
                    && !spec.rules.is_empty()
                {
                    chain.push(Task::backend(&group.id, BackendMethod::SetSecurityGroupRules));
                }
            }
            chain.push(Task::reconcile(id, ResourceKind::SecurityGroup));
        }

        let children: Vec<String> = networks
            .iter()
            .chain(subnets.iter())
            .chain(groups.iter())
            .map(|c| c.id.clone())
            .collect();
        for child in &children {
            chain.on_success(Task::transition(child, Transition::SetOk));
        }
        chain
            .on_success(Task::transition(id, Transition::SetOk))
            .on_failure(Task::compensate(id, children))
            .on_failure(Task::mark_erred(id));
        Ok(chain)
    }

    /// Everything in the tenant's scope, dependents first, then the tenant.
    pub(super) async fn tenant_delete_steps(
        &self,
        tenant: &ResourceRecord,
    ) -> Result<Vec<Task>, CoreError> {
        let mut steps = Vec::new();
        for kind in DELETE_ORDER {
            for record in self.store.list(kind, &tenant.id).await? {
                steps.extend(self.delete_steps(&record));
            }
        }
        steps.extend(self.delete_steps(tenant));
        Ok(steps)
    }
}
