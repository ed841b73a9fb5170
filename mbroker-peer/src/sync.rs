//! Converges the permissions of linked local projects onto the peer.
//!
//! Permissions are keyed by username. Local-only grants are added on the
//! peer, peer-only grants are removed, and grants present on both sides are
//! recreated when the role differs or updated in place when only the
//! expiration differs. Every peer call is isolated: a failure is counted and
//! logged and the rest of the diff still applies.

use mbroker_core::{
    Event, EventSink, LocalProject, PermissionStore, ProjectPermission, StoreError, diff_by_key,
};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{NewPeerProject, PeerClient, PeerError, PeerPermission};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts of what one run changed on the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub granted: usize,
    pub revoked: usize,
    pub updated: usize,
    pub recreated: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.granted += other.granted;
        self.revoked += other.revoked;
        self.updated += other.updated;
        self.recreated += other.recreated;
        self.failed += other.failed;
    }

    pub fn is_noop(&self) -> bool {
        *self == SyncReport::default()
    }
}

fn to_peer(permission: &ProjectPermission) -> PeerPermission {
    PeerPermission {
        username: permission.username.clone(),
        role: permission.role.as_str().to_string(),
        expiration_time: permission.expiration_time,
    }
}

pub struct PermissionSynchronizer {
    client: Arc<dyn PeerClient>,
    store: Arc<dyn PermissionStore>,
    events: EventSink,
    blacklist: HashSet<String>,
    /// Peer customer new projects are created under.
    customer: String,
}

impl PermissionSynchronizer {
    pub fn new(
        client: Arc<dyn PeerClient>,
        store: Arc<dyn PermissionStore>,
        events: EventSink,
        blacklist: impl IntoIterator<Item = String>,
        customer: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            events,
            blacklist: blacklist.into_iter().collect(),
            customer: customer.into(),
        }
    }

    /// Sync every linked project. A project that cannot be synced counts
    /// as one failure and does not stop the others.
    pub async fn sync_all(&self) -> Result<SyncReport, SyncError> {
        let projects = self.store.list_linked_projects().await?;
        let mut report = SyncReport::default();
        for project in &projects {
            match self.sync_project(project).await {
                Ok(r) => report.merge(r),
                Err(e) => {
                    warn!(project_id = %project.id, error = %e, "Project sync failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            projects = projects.len(),
            granted = report.granted,
            revoked = report.revoked,
            updated = report.updated,
            recreated = report.recreated,
            failed = report.failed,
            "Peer sync finished"
        );
        Ok(report)
    }

    pub async fn sync_project(&self, project: &LocalProject) -> Result<SyncReport, SyncError> {
        let local: Vec<ProjectPermission> = self
            .store
            .list_permissions(&project.id)
            .await?
            .into_iter()
            .filter(|p| !self.blacklist.contains(&p.username))
            .collect();

        let peer_project = match self.client.find_project(&project.id).await? {
            Some(p) => p,
            // nothing to grant, so no reason to create it
            None if local.is_empty() => return Ok(SyncReport::default()),
            None => {
                info!(project_id = %project.id, "Creating project on peer");
                self.client
                    .create_project(&NewPeerProject {
                        name: project.name.clone(),
                        description: project.description.clone(),
                        backend_id: project.id.clone(),
                        customer: self.customer.clone(),
                    })
                    .await?
            }
        };

        let remote: Vec<PeerPermission> = self
            .client
            .list_permissions(&peer_project.uuid)
            .await?
            .into_iter()
            .filter(|p| !self.blacklist.contains(&p.username))
            .collect();

        let diff = diff_by_key(
            local,
            remote,
            |l: &ProjectPermission| Some(l.username.clone()),
            |r: &PeerPermission| r.username.clone(),
        );
        debug!(
            project_id = %project.id,
            local_only = diff.stale.len(),
            peer_only = diff.new.len(),
            matching = diff.matching.len(),
            "Permission diff"
        );

        let uuid = peer_project.uuid.as_str();
        let mut report = SyncReport::default();

        for permission in &diff.stale {
            match self.client.add_permission(uuid, &to_peer(permission)).await {
                Ok(()) => {
                    report.granted += 1;
                    self.emit_granted(permission).await;
                }
                Err(e) => {
                    warn!(project_id = %project.id, username = %permission.username, error = %e, "Failed to grant permission on peer");
                    report.failed += 1;
                }
            }
        }

        for permission in &diff.new {
            match self
                .client
                .remove_permission(uuid, &permission.username, &permission.role)
                .await
            {
                Ok(()) => {
                    report.revoked += 1;
                    self.emit_revoked(&project.id, &permission.username).await;
                }
                Err(e) => {
                    warn!(project_id = %project.id, username = %permission.username, error = %e, "Failed to revoke permission on peer");
                    report.failed += 1;
                }
            }
        }

        for (local, remote) in &diff.matching {
            let wanted = to_peer(local);
            if wanted.role != remote.role {
                self.recreate(&project.id, uuid, local, remote, &mut report)
                    .await;
            } else if wanted.expiration_time != remote.expiration_time {
                match self.client.update_permission(uuid, &wanted).await {
                    Ok(()) => {
                        report.updated += 1;
                        self.events
                            .emit(Event::PermissionUpdated {
                                project_id: project.id.clone(),
                                username: local.username.clone(),
                                expiration_time: local.expiration_time,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!(project_id = %project.id, username = %local.username, error = %e, "Failed to update permission on peer");
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Role changes are a remove followed by a fresh grant.
    async fn recreate(
        &self,
        project_id: &str,
        uuid: &str,
        local: &ProjectPermission,
        remote: &PeerPermission,
        report: &mut SyncReport,
    ) {
        if let Err(e) = self
            .client
            .remove_permission(uuid, &remote.username, &remote.role)
            .await
        {
            warn!(project_id, username = %remote.username, error = %e, "Failed to remove permission before role change");
            report.failed += 1;
            return;
        }
        self.emit_revoked(project_id, &remote.username).await;

        match self.client.add_permission(uuid, &to_peer(local)).await {
            Ok(()) => {
                report.recreated += 1;
                self.emit_granted(local).await;
            }
            Err(e) => {
                warn!(project_id, username = %local.username, error = %e, "Failed to grant permission with new role");
                report.failed += 1;
            }
        }
    }

    async fn emit_granted(&self, permission: &ProjectPermission) {
        self.events
            .emit(Event::PermissionGranted {
                project_id: permission.project_id.clone(),
                username: permission.username.clone(),
                role: permission.role.as_str().to_string(),
            })
            .await;
    }

    async fn emit_revoked(&self, project_id: &str, username: &str) {
        self.events
            .emit(Event::PermissionRevoked {
                project_id: project_id.to_string(),
                username: username.to_string(),
            })
            .await;
    }
}
