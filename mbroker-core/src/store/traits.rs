//! Store trait definitions.
//!
//! The engine works against these traits only; the backing technology is
//! chosen by the binary.

use async_trait::async_trait;

use super::error::Result;
use crate::permission::{LocalProject, ProjectPermission};
use crate::resource::{ResourceKind, ResourceRecord};

/// Outcome of a batch import.
#[derive(Debug, Clone, Default)]
pub struct ImportBatchResult {
    pub inserted: Vec<ResourceRecord>,
    /// Records skipped because `(kind, scope, backend_id)` already existed,
    /// i.e. another pass imported them first.
    pub duplicates: Vec<ResourceRecord>,
}

/// Persistent resource records.
///
/// `(kind, scope, backend_id)` is unique among records that have a backend id.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ResourceRecord>>;

    /// All records of `kind` owned by `scope`, oldest first.
    async fn list(&self, kind: ResourceKind, scope: &str) -> Result<Vec<ResourceRecord>>;

    async fn list_children(&self, parent_id: &str) -> Result<Vec<ResourceRecord>>;

    async fn find_by_backend_id(
        &self,
        kind: ResourceKind,
        scope: &str,
        backend_id: &str,
    ) -> Result<Option<ResourceRecord>>;

    /// Insert a new record. Fails with `Conflict` on a duplicate.
    async fn insert(&self, record: ResourceRecord) -> Result<ResourceRecord>;

    /// Insert many records atomically, skipping duplicates.
    async fn import_batch(&self, records: Vec<ResourceRecord>) -> Result<ImportBatchResult>;

    /// Replace a record. `record.version` must match the stored version;
    /// the returned record carries the bumped version.
    async fn update(&self, record: ResourceRecord) -> Result<ResourceRecord>;

    /// Remove a record. Returns false if it was already gone.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Local projects and permissions synchronised to peers.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn put_project(&self, project: LocalProject) -> Result<()>;

    async fn get_project(&self, id: &str) -> Result<Option<LocalProject>>;

    async fn list_linked_projects(&self) -> Result<Vec<LocalProject>>;

    async fn list_permissions(&self, project_id: &str) -> Result<Vec<ProjectPermission>>;

    /// Create or replace the permission of a user in a project.
    async fn grant(&self, permission: ProjectPermission) -> Result<()>;

    async fn revoke(&self, project_id: &str, username: &str) -> Result<bool>;
}
