//! Chains for kinds without dedicated provisioning logic.

use mbroker_core::{
    ChangedFields, CoreError, ResourceKind, ResourceRecord, ResourceSpec, ResourceState,
    Transition, VolumeSpec,
};
use serde_json::json;

use super::Executor;
use crate::backend::BackendMethod;
use crate::chain::{Operation, TaskChain};
use crate::task::Task;

impl Executor {
    pub(super) fn plan_generic_create(&self, record: &ResourceRecord) -> TaskChain {
        let kind = record.kind();
        let id = record.id.as_str();
        let mut chain = TaskChain::new(id, Operation::Create);
        chain.push(
            Task::transition(id, Transition::BeginCreating).requires(ResourceState::CreationScheduled),
        );

        let create = Task::backend(id, BackendMethod::Create(kind));
        let create = match kind {
            ResourceKind::Volume | ResourceKind::Snapshot => create
                .throttled()
                .poll(self.poll_until(kind, "available")),
            _ => create,
        };
        chain.push(create);

        if let ResourceSpec::SecurityGroup(spec) = &record.spec
            && !spec.rules.is_empty()
        {
            chain.push(Task::backend(id, BackendMethod::SetSecurityGroupRules));
            chain.push(Task::pull(id, BackendMethod::Pull(kind)));
        }

        chain
            .on_success(Task::transition(id, Transition::SetOk))
            .on_failure(Task::mark_erred(id));
        chain
    }

    pub(super) fn generic_update_steps(
        &self,
        record: &ResourceRecord,
        changed: &ChangedFields,
    ) -> Vec<Task> {
        let kind = record.kind();
        let id = record.id.as_str();
        let mut steps = Vec::new();

        let special: &[&str] = match (&record.spec, kind) {
            (ResourceSpec::Volume(VolumeSpec { size_mb, .. }), _) if changed.contains("size_mb") => {
                steps.push(
                    Task::backend_with_args(id, BackendMethod::ExtendVolume, json!({ "size_mb": size_mb }))
                        .poll(self.poll_until(kind, "available")),
                );
                &["size_mb"]
            }
            (_, ResourceKind::SecurityGroup) if changed.contains("rules") => {
                steps.push(Task::backend(id, BackendMethod::SetSecurityGroupRules));
                &["rules"]
            }
            _ => &[],
        };

        let plain = changed
            .iter()
            .any(|f| !special.contains(&f) && kind.update_fields().contains(&f));
        if plain {
            steps.insert(0, Task::backend(id, BackendMethod::Update(kind)));
        }
        if kind == ResourceKind::SecurityGroup && !special.is_empty() {
            steps.push(Task::pull(id, BackendMethod::Pull(kind)));
        }
        steps
    }

    /// Children first, deepest first, then the record itself.
    pub(super) async fn generic_delete_steps(
        &self,
        record: &ResourceRecord,
    ) -> Result<Vec<Task>, CoreError> {
        let mut steps = Vec::new();
        for child in self.descendants(&record.id).await? {
            steps.extend(self.delete_steps(&child));
        }
        steps.extend(self.delete_steps(record));
        Ok(steps)
    }
}
