//! Lifecycle events.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::audit::BrokerAuditLogger;
use crate::resource::{ResourceId, ResourceKind, ResourceRecord, SecurityGroupRule};

/// Identifies the resource an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub name: String,
    pub backend_id: Option<String>,
}

impl From<&ResourceRecord> for ResourceRef {
    fn from(record: &ResourceRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind(),
            name: record.name.clone(),
            backend_id: record.backend_id.clone(),
        }
    }
}

/// Events emitted when a resource or permission changes.
///
/// Dispatched on a broadcast channel and mirrored to the audit log. The
/// engine never consumes its own events.
#[derive(Debug, Clone)]
pub enum Event {
    CreationScheduled(ResourceRef),
    Created(ResourceRef),
    UpdateScheduled(ResourceRef),
    Updated {
        resource: ResourceRef,
        changed: Vec<&'static str>,
    },
    DeletionScheduled(ResourceRef),
    Deleted(ResourceRef),
    Erred {
        resource: ResourceRef,
        message: String,
    },
    /// A remote object was materialised locally.
    Imported(ResourceRef),
    /// Backend fields were refreshed from the remote side.
    Pulled {
        resource: ResourceRef,
        changed: Vec<&'static str>,
    },
    /// A local record was dropped because it no longer exists remotely.
    CleanedFromCache(ResourceRef),
    SecurityGroupRuleRemoved {
        group: ResourceRef,
        rule: SecurityGroupRule,
    },

    // Peer permission events
    PermissionGranted {
        project_id: String,
        username: String,
        role: String,
    },
    PermissionRevoked {
        project_id: String,
        username: String,
    },
    PermissionUpdated {
        project_id: String,
        username: String,
        expiration_time: Option<DateTime<Utc>>,
    },
}

impl Event {
    /// Resource type this event concerns.
    pub fn resource_type(&self) -> &'static str {
        match self.resource() {
            Some(r) => r.kind.as_str(),
            None => "permission",
        }
    }

    /// Id of the affected resource, or `project_id/username` for permissions.
    pub fn resource_id(&self) -> String {
        match self {
            Event::PermissionGranted {
                project_id,
                username,
                ..
            }
            | Event::PermissionRevoked {
                project_id,
                username,
            }
            | Event::PermissionUpdated {
                project_id,
                username,
                ..
            } => format!("{}/{}", project_id, username),
            _ => self.resource().map(|r| r.id.clone()).unwrap_or_default(),
        }
    }

    pub fn resource(&self) -> Option<&ResourceRef> {
        match self {
            Event::CreationScheduled(r)
            | Event::Created(r)
            | Event::UpdateScheduled(r)
            | Event::DeletionScheduled(r)
            | Event::Deleted(r)
            | Event::Imported(r)
            | Event::CleanedFromCache(r) => Some(r),
            Event::Updated { resource, .. }
            | Event::Erred { resource, .. }
            | Event::Pulled { resource, .. } => Some(resource),
            Event::SecurityGroupRuleRemoved { group, .. } => Some(group),
            Event::PermissionGranted { .. }
            | Event::PermissionRevoked { .. }
            | Event::PermissionUpdated { .. } => None,
        }
    }
}

/// Fans events out to subscribers and the audit log.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
    audit: Arc<BrokerAuditLogger>,
}

impl EventSink {
    pub fn new(audit: Arc<BrokerAuditLogger>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx, audit }
    }

    /// Sink with a no-op audit logger.
    pub fn noop() -> Self {
        Self::new(Arc::new(BrokerAuditLogger::new_noop()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn audit(&self) -> &Arc<BrokerAuditLogger> {
        &self.audit
    }

    pub async fn emit(&self, event: Event) {
        self.audit.record(&event).await;
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}
