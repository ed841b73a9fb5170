//! In-memory store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::error::{Result, StoreError};
use super::traits::{ImportBatchResult, PermissionStore, ResourceStore};
use crate::permission::{LocalProject, ProjectPermission};
use crate::resource::{ResourceKind, ResourceRecord};

type BackendKey = (ResourceKind, String, String);

#[derive(Default)]
struct Inner {
    resources: HashMap<String, ResourceRecord>,
    by_backend_id: HashMap<BackendKey, String>,
    projects: HashMap<String, LocalProject>,
    permissions: HashMap<(String, String), ProjectPermission>,
}

impl Inner {
    fn backend_key(record: &ResourceRecord) -> Option<BackendKey> {
        record
            .backend_id
            .as_ref()
            .map(|bid| (record.kind(), record.scope.clone(), bid.clone()))
    }

    fn check_unique(&self, record: &ResourceRecord) -> Result<()> {
        if self.resources.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!(
                "resource {} already exists",
                record.id
            )));
        }
        if let Some(key) = Self::backend_key(record)
            && self.by_backend_id.contains_key(&key)
        {
            return Err(StoreError::Conflict(format!(
                "{} with backend id {} already exists in {}",
                key.0, key.2, key.1
            )));
        }
        Ok(())
    }

    fn put(&mut self, record: ResourceRecord) {
        if let Some(key) = Self::backend_key(&record) {
            self.by_backend_id.insert(key, record.id.clone());
        }
        self.resources.insert(record.id.clone(), record);
    }
}

fn sorted(mut records: Vec<ResourceRecord>) -> Vec<ResourceRecord> {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    records
}

/// Store keeping everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<ResourceRecord>> {
        Ok(self.inner.read().await.resources.get(id).cloned())
    }

    async fn list(&self, kind: ResourceKind, scope: &str) -> Result<Vec<ResourceRecord>> {
        let inner = self.inner.read().await;
        Ok(sorted(
            inner
                .resources
                .values()
                .filter(|r| r.kind() == kind && r.scope == scope)
                .cloned()
                .collect(),
        ))
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<ResourceRecord>> {
        let inner = self.inner.read().await;
        Ok(sorted(
            inner
                .resources
                .values()
                .filter(|r| r.parent_id.as_deref() == Some(parent_id))
                .cloned()
                .collect(),
        ))
    }

    async fn find_by_backend_id(
        &self,
        kind: ResourceKind,
        scope: &str,
        backend_id: &str,
    ) -> Result<Option<ResourceRecord>> {
        let inner = self.inner.read().await;
        let key = (kind, scope.to_string(), backend_id.to_string());
        Ok(inner
            .by_backend_id
            .get(&key)
            .and_then(|id| inner.resources.get(id))
            .cloned())
    }

    async fn insert(&self, record: ResourceRecord) -> Result<ResourceRecord> {
        let mut inner = self.inner.write().await;
        inner.check_unique(&record)?;
        inner.put(record.clone());
        Ok(record)
    }

    async fn import_batch(&self, records: Vec<ResourceRecord>) -> Result<ImportBatchResult> {
        let mut inner = self.inner.write().await;
        let mut result = ImportBatchResult::default();
        for record in records {
            if inner.check_unique(&record).is_err() {
                result.duplicates.push(record);
            } else {
                inner.put(record.clone());
                result.inserted.push(record);
            }
        }
        Ok(result)
    }

    async fn update(&self, mut record: ResourceRecord) -> Result<ResourceRecord> {
        let mut inner = self.inner.write().await;
        let current = inner
            .resources
            .get(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        if current.version != record.version {
            return Err(StoreError::VersionMismatch {
                expected: record.version,
                actual: current.version,
            });
        }

        let old_key = Inner::backend_key(current);
        let new_key = Inner::backend_key(&record);
        if new_key != old_key {
            if let Some(key) = &new_key
                && inner.by_backend_id.contains_key(key)
            {
                return Err(StoreError::Conflict(format!(
                    "{} with backend id {} already exists in {}",
                    key.0, key.2, key.1
                )));
            }
            if let Some(key) = old_key {
                inner.by_backend_id.remove(&key);
            }
        }

        record.version += 1;
        inner.put(record.clone());
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.resources.remove(id) {
            Some(record) => {
                if let Some(key) = Inner::backend_key(&record) {
                    inner.by_backend_id.remove(&key);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn put_project(&self, project: LocalProject) -> Result<()> {
        self.inner
            .write()
            .await
            .projects
            .insert(project.id.clone(), project);
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<LocalProject>> {
        Ok(self.inner.read().await.projects.get(id).cloned())
    }

    async fn list_linked_projects(&self) -> Result<Vec<LocalProject>> {
        let inner = self.inner.read().await;
        let mut projects: Vec<_> = inner.projects.values().filter(|p| p.linked).cloned().collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn list_permissions(&self, project_id: &str) -> Result<Vec<ProjectPermission>> {
        let inner = self.inner.read().await;
        let mut permissions: Vec<_> = inner
            .permissions
            .values()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect();
        permissions.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(permissions)
    }

    async fn grant(&self, permission: ProjectPermission) -> Result<()> {
        let key = (permission.project_id.clone(), permission.username.clone());
        self.inner.write().await.permissions.insert(key, permission);
        Ok(())
    }

    async fn revoke(&self, project_id: &str, username: &str) -> Result<bool> {
        let key = (project_id.to_string(), username.to_string());
        Ok(self.inner.write().await.permissions.remove(&key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::ProjectRole;
    use crate::resource::{NetworkSpec, ResourceSpec};

    fn network(scope: &str, backend_id: Option<&str>) -> ResourceRecord {
        let mut record =
            ResourceRecord::new(scope, "net", ResourceSpec::Network(NetworkSpec::default()));
        record.backend_id = backend_id.map(str::to_string);
        record
    }

    #[tokio::test]
    async fn test_backend_id_unique_per_scope() {
        let store = MemoryStore::new();
        store.insert(network("t1", Some("n1"))).await.unwrap();
        store.insert(network("t2", Some("n1"))).await.unwrap();
        store.insert(network("t1", None)).await.unwrap();
        store.insert(network("t1", None)).await.unwrap();

        let err = store.insert(network("t1", Some("n1"))).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.list(ResourceKind::Network, "t1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_import_batch_skips_duplicates() {
        let store = MemoryStore::new();
        store.insert(network("t1", Some("n1"))).await.unwrap();

        let result = store
            .import_batch(vec![network("t1", Some("n1")), network("t1", Some("n2"))])
            .await
            .unwrap();
        assert_eq!(result.inserted.len(), 1);
        assert_eq!(result.duplicates.len(), 1);
        assert!(
            store
                .find_by_backend_id(ResourceKind::Network, "t1", "n2")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let store = MemoryStore::new();
        let record = store.insert(network("t1", None)).await.unwrap();

        let mut first = record.clone();
        first.backend_id = Some("n9".into());
        let saved = store.update(first).await.unwrap();
        assert_eq!(saved.version, 1);
        assert!(
            store
                .find_by_backend_id(ResourceKind::Network, "t1", "n9")
                .await
                .unwrap()
                .is_some()
        );

        let err = store.update(record).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_delete_frees_backend_id() {
        let store = MemoryStore::new();
        let record = store.insert(network("t1", Some("n1"))).await.unwrap();
        assert!(store.delete(&record.id).await.unwrap());
        assert!(!store.delete(&record.id).await.unwrap());
        store.insert(network("t1", Some("n1"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_permissions() {
        let store = MemoryStore::new();
        store
            .put_project(LocalProject {
                id: "p1".into(),
                name: "Project".into(),
                description: String::new(),
                linked: true,
            })
            .await
            .unwrap();
        store
            .grant(ProjectPermission {
                project_id: "p1".into(),
                username: "bob".into(),
                role: ProjectRole::Member,
                expiration_time: None,
            })
            .await
            .unwrap();

        assert_eq!(store.list_linked_projects().await.unwrap().len(), 1);
        assert_eq!(store.list_permissions("p1").await.unwrap().len(), 1);
        assert!(store.revoke("p1", "bob").await.unwrap());
        assert!(store.list_permissions("p1").await.unwrap().is_empty());
    }
}
