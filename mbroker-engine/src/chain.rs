//! Ordered task sequences with success and failure continuations.

use mbroker_core::{QuotaHold, ResourceId};
use std::fmt;

use crate::backend::BackendMethod;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Pull,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Pull => "pull",
        })
    }
}

/// Tasks for one lifecycle operation on one resource.
///
/// Tasks run strictly in order. The first failure aborts the rest and runs
/// `on_failure`; otherwise `on_success` runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskChain {
    pub resource_id: ResourceId,
    pub operation: Operation,
    pub tasks: Vec<Task>,
    pub on_success: Vec<Task>,
    pub on_failure: Vec<Task>,
    pub quota_holds: Vec<QuotaHold>,
}

impl TaskChain {
    pub fn new(resource_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            resource_id: resource_id.into(),
            operation,
            tasks: Vec::new(),
            on_success: Vec::new(),
            on_failure: Vec::new(),
            quota_holds: Vec::new(),
        }
    }

    pub fn push(&mut self, task: Task) -> &mut Self {
        self.tasks.push(task);
        self
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = Task>) -> &mut Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn on_success(&mut self, task: Task) -> &mut Self {
        self.on_success.push(task);
        self
    }

    pub fn on_failure(&mut self, task: Task) -> &mut Self {
        self.on_failure.push(task);
        self
    }

    /// Attach the quota holds taken for this chain. However the chain ends,
    /// its last continuation step settles them into confirmed usage.
    pub fn with_quota_holds(&mut self, holds: Vec<QuotaHold>) -> &mut Self {
        if !holds.is_empty() {
            let id = self.resource_id.clone();
            self.on_success(Task::confirm_quotas(&id))
                .on_failure(Task::confirm_quotas(&id));
        }
        self.quota_holds = holds;
        self
    }

    /// Backend methods the main sequence calls, in order.
    pub fn backend_methods(&self) -> Vec<BackendMethod> {
        self.tasks.iter().filter_map(Task::backend_method).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
