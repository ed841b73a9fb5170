//! Instance chains. Volumes are provisioned before the instance that boots
//! from them and outlive it only when the caller asks for that.

use mbroker_core::{
    ChangedFields, CoreError, InstanceSpec, ResourceKind, ResourceRecord, ResourceSpec,
    ResourceState, Transition, VolumeSpec,
};
use serde_json::{Value, json};

use super::{CreateOptions, DeleteOptions, Executor};
use crate::backend::BackendMethod;
use crate::chain::{Operation, TaskChain};
use crate::task::Task;

fn instance_spec(record: &ResourceRecord) -> Option<&InstanceSpec> {
    match &record.spec {
        ResourceSpec::Instance(spec) => Some(spec),
        _ => None,
    }
}

fn is_bootable(record: &ResourceRecord) -> bool {
    matches!(&record.spec, ResourceSpec::Volume(VolumeSpec { bootable: true, .. }))
}

/// System volume and optional data volume of a new instance.
pub(super) fn materialize_volumes(
    instance: &ResourceRecord,
    options: &CreateOptions,
) -> Vec<ResourceRecord> {
    let Some(spec) = instance_spec(instance) else {
        return Vec::new();
    };

    let mut volumes = vec![
        ResourceRecord::new(
            instance.scope.clone(),
            format!("{}-system", instance.name),
            ResourceSpec::Volume(VolumeSpec {
                size_mb: spec.disk_mb,
                bootable: true,
                image_name: Some(spec.image_name.clone()),
                ..Default::default()
            }),
        )
        .with_parent(instance.id.clone()),
    ];
    if let Some(size_mb) = options.data_volume_size_mb {
        volumes.push(
            ResourceRecord::new(
                instance.scope.clone(),
                format!("{}-data", instance.name),
                ResourceSpec::Volume(VolumeSpec {
                    size_mb,
                    ..Default::default()
                }),
            )
            .with_parent(instance.id.clone()),
        );
    }
    volumes
}

impl Executor {
    /// Volumes of an instance, bootable first.
    async fn volumes_of(&self, instance: &ResourceRecord) -> Result<Vec<ResourceRecord>, CoreError> {
        let mut volumes: Vec<ResourceRecord> = self
            .store
            .list_children(&instance.id)
            .await?
            .into_iter()
            .filter(|c| c.kind() == ResourceKind::Volume)
            .collect();
        volumes.sort_by_key(|v| !is_bootable(v));
        Ok(volumes)
    }

    async fn backend_ids(&self, ids: &[String]) -> Result<Vec<String>, CoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.store.get(id).await?
                && let Some(backend_id) = record.backend_id
            {
                out.push(backend_id);
            }
        }
        Ok(out)
    }

    pub(super) async fn plan_instance_create(
        &self,
        instance: &ResourceRecord,
    ) -> Result<TaskChain, CoreError> {
        let volumes = self.volumes_of(instance).await?;
        let id = instance.id.as_str();
        let mut chain = TaskChain::new(id, Operation::Create);
        chain.push(
            Task::transition(id, Transition::BeginCreating).requires(ResourceState::CreationScheduled),
        );

        for volume in &volumes {
            chain.push(
                Task::backend(&volume.id, BackendMethod::Create(ResourceKind::Volume))
                    .requires(ResourceState::CreationScheduled)
                    .throttled()
                    .poll(self.poll_until(ResourceKind::Volume, "available"))
                    .then(Transition::BeginCreating),
            );
        }

        let mut args = serde_json::Map::new();
        if let Some(spec) = instance_spec(instance) {
            let groups = self.backend_ids(&spec.security_group_ids).await?;
            args.insert("security_group_backend_ids".into(), json!(groups));
            if let Some(server_group) = &spec.server_group_id {
                let ids = self.backend_ids(std::slice::from_ref(server_group)).await?;
                if let Some(backend_id) = ids.into_iter().next() {
                    args.insert("server_group_backend_id".into(), Value::String(backend_id));
                }
            }
        }
        chain.push(
            Task::backend_with_args(id, BackendMethod::Create(ResourceKind::Instance), Value::Object(args))
                .throttled()
                .poll(self.poll_until(ResourceKind::Instance, "ACTIVE")),
        );

        if let Some(spec) = instance_spec(instance) {
            for fip_id in &spec.floating_ip_ids {
                let Some(fip) = self.store.get(fip_id).await? else {
                    continue;
                };
                let Some(backend_id) = fip.backend_id else {
                    continue;
                };
                chain.push(Task::backend_with_args(
                    id,
                    BackendMethod::AssignFloatingIp,
                    json!({ "floating_ip_id": fip.id, "floating_ip_backend_id": backend_id }),
                ));
            }
        }
        chain.push(Task::pull(id, BackendMethod::Pull(ResourceKind::Instance)));

        for volume in &volumes {
            chain.on_success(Task::transition(&volume.id, Transition::SetOk));
        }
        chain
            .on_success(Task::transition(id, Transition::SetOk))
            .on_failure(Task::compensate(id, volumes.iter().map(|v| v.id.clone()).collect()))
            .on_failure(Task::mark_erred(id));
        Ok(chain)
    }

    pub(super) async fn instance_update_steps(
        &self,
        instance: &ResourceRecord,
        changed: &ChangedFields,
    ) -> Result<Vec<Task>, CoreError> {
        let id = instance.id.as_str();
        let mut steps = Vec::new();

        if changed.contains("name") {
            steps.push(Task::backend(id, BackendMethod::Update(ResourceKind::Instance)));
        }
        if changed.contains("flavor_name")
            && let Some(spec) = instance_spec(instance)
        {
            steps.push(
                Task::backend_with_args(
                    id,
                    BackendMethod::ResizeInstance,
                    json!({ "flavor_name": spec.flavor_name }),
                )
                .poll(self.poll_until(ResourceKind::Instance, "SHUTOFF").or_success("ACTIVE")),
            );
        }
        if changed.contains("security_group_ids")
            && let Some(spec) = instance_spec(instance)
        {
            let groups = self.backend_ids(&spec.security_group_ids).await?;
            steps.push(Task::backend_with_args(
                id,
                BackendMethod::UpdateInstanceSecurityGroups,
                json!({ "security_group_backend_ids": groups }),
            ));
        }
        steps.push(Task::pull(id, BackendMethod::Pull(ResourceKind::Instance)));
        Ok(steps)
    }

    pub(super) async fn instance_delete_steps(
        &self,
        instance: &ResourceRecord,
        options: &DeleteOptions,
    ) -> Result<Vec<Task>, CoreError> {
        let volumes = self.volumes_of(instance).await?;
        let (bootable, data): (Vec<_>, Vec<_>) = volumes.into_iter().partition(is_bootable);
        let mut steps = Vec::new();

        let keep_data = !options.delete_volumes && !data.is_empty();
        if keep_data {
            for volume in &data {
                steps.push(
                    Task::backend(&volume.id, BackendMethod::DetachVolume)
                        .poll(self.poll_until(ResourceKind::Volume, "available")),
                );
                steps.push(Task::detach_local(&volume.id));
            }
        }

        let id = instance.id.as_str();
        let poll = &self.config.poll;
        steps.push(Task::backend(id, BackendMethod::Delete(ResourceKind::Instance)));
        steps.push(Task::delete_verify(
            id,
            BackendMethod::Pull(ResourceKind::Instance),
            poll.interval(),
            poll.instance_timeout(),
        ));

        for volume in bootable.iter().chain(data.iter().filter(|_| !keep_data)) {
            steps.extend(self.delete_steps(volume));
        }
        steps.push(Task::delete_local(id));

        if options.release_floating_ips
            && let Some(spec) = instance_spec(instance)
        {
            for fip_id in &spec.floating_ip_ids {
                if let Some(fip) = self.store.get(fip_id).await? {
                    steps.extend(self.delete_steps(&fip));
                }
            }
        }
        Ok(steps)
    }
}
