//! Resource lifecycle state machine.
//!
//! Every managed resource moves through the same states:
//!
//! ```text
//! (unset) -> CREATION_SCHEDULED -> CREATING -> OK
//! OK | ERRED -> UPDATE_SCHEDULED -> UPDATING -> OK
//! OK | ERRED -> DELETION_SCHEDULED -> DELETING -> (removed)
//! any transitional state -> ERRED
//! ```
//!
//! `OK` and `ERRED` are the stable states. A chain asserts the current state
//! in its first task, so a second chain racing for the same resource fails
//! with [`InvalidTransition`] instead of corrupting it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::resource::ResourceRecord;

/// Lifecycle state shared by every resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    CreationScheduled,
    Creating,
    UpdateScheduled,
    Updating,
    DeletionScheduled,
    Deleting,
    Ok,
    Erred,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::CreationScheduled => "CREATION_SCHEDULED",
            ResourceState::Creating => "CREATING",
            ResourceState::UpdateScheduled => "UPDATE_SCHEDULED",
            ResourceState::Updating => "UPDATING",
            ResourceState::DeletionScheduled => "DELETION_SCHEDULED",
            ResourceState::Deleting => "DELETING",
            ResourceState::Ok => "OK",
            ResourceState::Erred => "ERRED",
        }
    }

    /// Stable states are the only ones reconciliation may overwrite.
    pub fn is_stable(&self) -> bool {
        matches!(self, ResourceState::Ok | ResourceState::Erred)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATION_SCHEDULED" => Ok(ResourceState::CreationScheduled),
            "CREATING" => Ok(ResourceState::Creating),
            "UPDATE_SCHEDULED" => Ok(ResourceState::UpdateScheduled),
            "UPDATING" => Ok(ResourceState::Updating),
            "DELETION_SCHEDULED" => Ok(ResourceState::DeletionScheduled),
            "DELETING" => Ok(ResourceState::Deleting),
            "OK" => Ok(ResourceState::Ok),
            "ERRED" => Ok(ResourceState::Erred),
            other => Err(format!("unknown resource state '{}'", other)),
        }
    }
}

/// Named transitions between lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// unset -> CREATION_SCHEDULED
    ScheduleCreating,
    /// CREATION_SCHEDULED -> CREATING
    BeginCreating,
    /// OK | ERRED -> UPDATE_SCHEDULED
    ScheduleUpdating,
    /// UPDATE_SCHEDULED -> UPDATING
    BeginUpdating,
    /// OK | ERRED -> DELETION_SCHEDULED
    ScheduleDeleting,
    /// DELETION_SCHEDULED -> DELETING
    BeginDeleting,
    /// CREATION_SCHEDULED | CREATING | UPDATE_SCHEDULED | UPDATING -> OK
    SetOk,
    /// any transitional state -> ERRED, no-op when already ERRED
    SetErred,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::ScheduleCreating => "schedule_creating",
            Transition::BeginCreating => "begin_creating",
            Transition::ScheduleUpdating => "schedule_updating",
            Transition::BeginUpdating => "begin_updating",
            Transition::ScheduleDeleting => "schedule_deleting",
            Transition::BeginDeleting => "begin_deleting",
            Transition::SetOk => "set_ok",
            Transition::SetErred => "set_erred",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a transition is not legal from the current state.
///
/// This is a programming or race error: it is surfaced, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {transition} resource {resource_id} from state {}", display_state(.from))]
pub struct InvalidTransition {
    pub resource_id: String,
    pub from: Option<ResourceState>,
    pub transition: Transition,
}

fn display_state(state: &Option<ResourceState>) -> &'static str {
    state.map(|s| s.as_str()).unwrap_or("(unset)")
}

/// Target state of `transition` from `from`, or `None` if it is illegal.
pub fn target(from: Option<ResourceState>, transition: Transition) -> Option<ResourceState> {
    use ResourceState::*;

    match (transition, from) {
        (Transition::ScheduleCreating, None) => Some(CreationScheduled),
        (Transition::BeginCreating, Some(CreationScheduled)) => Some(Creating),
        (Transition::ScheduleUpdating, Some(Ok | Erred)) => Some(UpdateScheduled),
        (Transition::BeginUpdating, Some(UpdateScheduled)) => Some(Updating),
        (Transition::ScheduleDeleting, Some(Ok | Erred)) => Some(DeletionScheduled),
        (Transition::BeginDeleting, Some(DeletionScheduled)) => Some(Deleting),
        (
            Transition::SetOk,
            Some(CreationScheduled | Creating | UpdateScheduled | Updating),
        ) => Some(Ok),
        (Transition::SetErred, Some(state)) if state != Ok => Some(Erred),
        _ => None,
    }
}

/// Whether `transition` is legal from `from`.
pub fn can_transition(from: Option<ResourceState>, transition: Transition) -> bool {
    target(from, transition).is_some()
}

/// Apply `transition` to a resource, returning the updated resource.
pub fn apply(
    mut resource: ResourceRecord,
    transition: Transition,
) -> Result<ResourceRecord, InvalidTransition> {
    resource.transition(transition)?;
    Ok(resource)
}
