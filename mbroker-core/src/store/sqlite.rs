//! SQLite-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::debug;

use super::error::{Result, StoreError};
use super::traits::{ImportBatchResult, PermissionStore, ResourceStore};
use crate::permission::{LocalProject, ProjectPermission};
use crate::resource::{ResourceKind, ResourceRecord};

const RESOURCE_COLUMNS: &str = "id, kind, scope, parent_id, name, description, backend_id, \
     state, runtime_state, error_message, spec, version, created_at, modified_at";

/// SQLite-backed store for resources and permissions
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, one connection so every query sees it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                scope TEXT NOT NULL,
                parent_id TEXT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                backend_id TEXT,
                state TEXT NOT NULL,
                runtime_state TEXT NOT NULL DEFAULT '',
                error_message TEXT,
                spec TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // NULL backend ids never collide
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_backend_id
            ON resources (kind, scope, backend_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_resources_parent ON resources (parent_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                linked INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permissions (
                project_id TEXT NOT NULL,
                username TEXT NOT NULL,
                role TEXT NOT NULL,
                expiration_time TEXT,
                PRIMARY KEY (project_id, username)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Store schema ready");
        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> Result<ResourceRecord> {
        let state: String = row.get("state");
        let spec: String = row.get("spec");
        let version: i64 = row.get("version");
        let created_at: String = row.get("created_at");
        let modified_at: String = row.get("modified_at");

        Ok(ResourceRecord {
            id: row.get("id"),
            scope: row.get("scope"),
            parent_id: row.get("parent_id"),
            name: row.get("name"),
            description: row.get("description"),
            backend_id: row.get("backend_id"),
            state: state.parse().map_err(StoreError::Internal)?,
            runtime_state: row.get("runtime_state"),
            error_message: row.get("error_message"),
            spec: serde_json::from_str(&spec)?,
            version: version as u64,
            created_at: parse_time(&created_at)?,
            modified_at: parse_time(&modified_at)?,
        })
    }

    fn row_to_permission(row: &SqliteRow) -> Result<ProjectPermission> {
        let role: String = row.get("role");
        let expiration_time: Option<String> = row.get("expiration_time");
        Ok(ProjectPermission {
            project_id: row.get("project_id"),
            username: row.get("username"),
            role: role.parse().map_err(StoreError::Internal)?,
            expiration_time: expiration_time.as_deref().map(parse_time).transpose()?,
        })
    }

    fn row_to_project(row: &SqliteRow) -> LocalProject {
        let linked: i64 = row.get("linked");
        LocalProject {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            linked: linked != 0,
        }
    }

    async fn fetch_records(&self, sql: &str, binds: &[&str]) -> Result<Vec<ResourceRecord>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_record).collect()
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Internal(format!("invalid timestamp '{}': {}", s, e)))
}

fn insert_sql(on_conflict: &str) -> String {
    format!(
        "INSERT INTO resources ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) {}",
        RESOURCE_COLUMNS, on_conflict
    )
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    record: &ResourceRecord,
    spec: String,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(record.id.clone())
        .bind(record.kind().as_str())
        .bind(record.scope.clone())
        .bind(record.parent_id.clone())
        .bind(record.name.clone())
        .bind(record.description.clone())
        .bind(record.backend_id.clone())
        .bind(record.state.as_str())
        .bind(record.runtime_state.clone())
        .bind(record.error_message.clone())
        .bind(spec)
        .bind(record.version as i64)
        .bind(record.created_at.to_rfc3339())
        .bind(record.modified_at.to_rfc3339())
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<ResourceRecord>> {
        let sql = format!("SELECT {} FROM resources WHERE id = ?", RESOURCE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(&self, kind: ResourceKind, scope: &str) -> Result<Vec<ResourceRecord>> {
        let sql = format!(
            "SELECT {} FROM resources WHERE kind = ? AND scope = ? ORDER BY created_at, id",
            RESOURCE_COLUMNS
        );
        self.fetch_records(&sql, &[kind.as_str(), scope]).await
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<ResourceRecord>> {
        let sql = format!(
            "SELECT {} FROM resources WHERE parent_id = ? ORDER BY created_at, id",
            RESOURCE_COLUMNS
        );
        self.fetch_records(&sql, &[parent_id]).await
    }

    async fn find_by_backend_id(
        &self,
        kind: ResourceKind,
        scope: &str,
        backend_id: &str,
    ) -> Result<Option<ResourceRecord>> {
        let sql = format!(
            "SELECT {} FROM resources WHERE kind = ? AND scope = ? AND backend_id = ?",
            RESOURCE_COLUMNS
        );
        Ok(self
            .fetch_records(&sql, &[kind.as_str(), scope, backend_id])
            .await?
            .into_iter()
            .next())
    }

    async fn insert(&self, record: ResourceRecord) -> Result<ResourceRecord> {
        let spec = serde_json::to_string(&record.spec)?;
        let sql = insert_sql("");
        bind_record(sqlx::query(&sql), &record, spec)
            .execute(&self.pool)
            .await?;
        Ok(record)
    }

    async fn import_batch(&self, records: Vec<ResourceRecord>) -> Result<ImportBatchResult> {
        let sql = insert_sql("ON CONFLICT DO NOTHING");
        let mut result = ImportBatchResult::default();
        let mut tx = self.pool.begin().await?;

        for record in records {
            let spec = serde_json::to_string(&record.spec)?;
            let done = bind_record(sqlx::query(&sql), &record, spec)
                .execute(&mut *tx)
                .await?;
            if done.rows_affected() == 0 {
                result.duplicates.push(record);
            } else {
                result.inserted.push(record);
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn update(&self, mut record: ResourceRecord) -> Result<ResourceRecord> {
        let spec = serde_json::to_string(&record.spec)?;
        let done = sqlx::query(
            r#"
            UPDATE resources SET
                parent_id = ?, name = ?, description = ?, backend_id = ?, state = ?,
                runtime_state = ?, error_message = ?, spec = ?, modified_at = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&record.parent_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.backend_id)
        .bind(record.state.as_str())
        .bind(&record.runtime_state)
        .bind(&record.error_message)
        .bind(&spec)
        .bind(record.modified_at.to_rfc3339())
        .bind(&record.id)
        .bind(record.version as i64)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            let current = self
                .get(&record.id)
                .await?
                .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
            return Err(StoreError::VersionMismatch {
                expected: record.version,
                actual: current.version,
            });
        }

        record.version += 1;
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl PermissionStore for SqliteStore {
    async fn put_project(&self, project: LocalProject) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, linked) VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                linked = excluded.linked
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.linked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<LocalProject>> {
        let row = sqlx::query("SELECT id, name, description, linked FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_project))
    }

    async fn list_linked_projects(&self) -> Result<Vec<LocalProject>> {
        let rows = sqlx::query(
            "SELECT id, name, description, linked FROM projects WHERE linked = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_project).collect())
    }

    async fn list_permissions(&self, project_id: &str) -> Result<Vec<ProjectPermission>> {
        let rows = sqlx::query(
            r#"
            SELECT project_id, username, role, expiration_time
            FROM permissions WHERE project_id = ? ORDER BY username
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_permission).collect()
    }

    async fn grant(&self, permission: ProjectPermission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO permissions (project_id, username, role, expiration_time)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (project_id, username) DO UPDATE SET
                role = excluded.role,
                expiration_time = excluded.expiration_time
            "#,
        )
        .bind(&permission.project_id)
        .bind(&permission.username)
        .bind(permission.role.as_str())
        .bind(permission.expiration_time.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, project_id: &str, username: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM permissions WHERE project_id = ? AND username = ?")
            .bind(project_id)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::ProjectRole;
    use crate::resource::{SecurityGroupRule, SecurityGroupSpec, ResourceSpec};
    use crate::state::ResourceState;

    fn group(scope: &str, backend_id: &str) -> ResourceRecord {
        let mut record = ResourceRecord::new(
            scope,
            "default",
            ResourceSpec::SecurityGroup(SecurityGroupSpec {
                rules: vec![SecurityGroupRule {
                    backend_id: Some("rule-1".into()),
                    direction: "ingress".into(),
                    ethertype: "IPv4".into(),
                    from_port: Some(22),
                    to_port: Some(22),
                    ..Default::default()
                }],
            }),
        );
        record.backend_id = Some(backend_id.into());
        record.state = ResourceState::Ok;
        record
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let record = store.insert(group("t1", "sg-1")).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_duplicate_backend_id_conflicts() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert(group("t1", "sg-1")).await.unwrap();
        let err = store.insert(group("t1", "sg-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_import_batch_treats_duplicates_as_imported() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert(group("t1", "sg-1")).await.unwrap();

        let result = store
            .import_batch(vec![group("t1", "sg-1"), group("t1", "sg-2")])
            .await
            .unwrap();
        assert_eq!(result.inserted.len(), 1);
        assert_eq!(result.duplicates.len(), 1);
        assert_eq!(
            store
                .list(ResourceKind::SecurityGroup, "t1")
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_update_version_mismatch() {
        let store = SqliteStore::in_memory().await.unwrap();
        let record = store.insert(group("t1", "sg-1")).await.unwrap();

        let mut renamed = record.clone();
        renamed.name = "web".into();
        let saved = store.update(renamed).await.unwrap();
        assert_eq!(saved.version, 1);

        let err = store.update(record).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch {
                expected: 0,
                actual: 1
            }
        ));
        let found = store
            .find_by_backend_id(ResourceKind::SecurityGroup, "t1", "sg-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "web");
    }

    #[tokio::test]
    async fn test_permission_upsert() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .put_project(LocalProject {
                id: "p1".into(),
                name: "Project".into(),
                description: String::new(),
                linked: true,
            })
            .await
            .unwrap();

        let mut permission = ProjectPermission {
            project_id: "p1".into(),
            username: "alice".into(),
            role: ProjectRole::Member,
            expiration_time: None,
        };
        store.grant(permission.clone()).await.unwrap();
        permission.role = ProjectRole::Manager;
        store.grant(permission.clone()).await.unwrap();

        let permissions = store.list_permissions("p1").await.unwrap();
        assert_eq!(permissions, vec![permission]);
        assert_eq!(store.list_linked_projects().await.unwrap().len(), 1);
        assert!(store.revoke("p1", "alice").await.unwrap());
    }
}
