use mbroker_log::{AuditLogger, LogEntry, LogLevel};
use std::sync::Arc;

use crate::event::{Event, ResourceRef};
use crate::resource::SecurityGroupRule;

/// Lifecycle audit logger
pub struct BrokerAuditLogger {
    inner: Arc<AuditLogger>,
}

impl BrokerAuditLogger {
    pub fn new(log_endpoint: &str, component: &str) -> Self {
        Self {
            inner: Arc::new(AuditLogger::new(log_endpoint, component)),
        }
    }

    pub fn new_noop() -> Self {
        Self {
            inner: Arc::new(AuditLogger::new_noop()),
        }
    }

    /// Logger keeping entries in memory, for assertions in tests.
    pub fn new_recording() -> Self {
        Self {
            inner: Arc::new(AuditLogger::new_recording("broker")),
        }
    }

    pub async fn entries(&self) -> Vec<LogEntry> {
        self.inner.entries().await
    }

    async fn log(&self, level: LogLevel, message: String, object_ids: Vec<String>) {
        self.inner.log(level, message, object_ids).await;
    }

    fn ids(resource: &ResourceRef) -> Vec<String> {
        let mut ids = vec![resource.id.clone()];
        if let Some(backend_id) = &resource.backend_id {
            ids.push(backend_id.clone());
        }
        ids
    }

    /// Record any event with its matching message.
    pub async fn record(&self, event: &Event) {
        match event {
            Event::CreationScheduled(r) => self.creation_scheduled(r).await,
            Event::Created(r) => self.created(r).await,
            Event::UpdateScheduled(r) => self.update_scheduled(r).await,
            Event::Updated { resource, changed } => self.updated(resource, changed).await,
            Event::DeletionScheduled(r) => self.deletion_scheduled(r).await,
            Event::Deleted(r) => self.deleted(r).await,
            Event::Erred { resource, message } => self.erred(resource, message).await,
            Event::Imported(r) => self.imported(r).await,
            Event::Pulled { resource, changed } => self.pulled(resource, changed).await,
            Event::CleanedFromCache(r) => self.cleaned_from_cache(r).await,
            Event::SecurityGroupRuleRemoved { group, rule } => {
                self.security_group_rule_removed(group, rule).await
            }
            Event::PermissionGranted {
                project_id,
                username,
                role,
            } => self.permission_granted(project_id, username, role).await,
            Event::PermissionRevoked {
                project_id,
                username,
            } => self.permission_revoked(project_id, username).await,
            Event::PermissionUpdated {
                project_id,
                username,
                expiration_time,
            } => {
                let expires = expiration_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                self.permission_updated(project_id, username, &expires).await
            }
        }
    }

    // Resource lifecycle
    pub async fn creation_scheduled(&self, r: &ResourceRef) {
        self.log(
            LogLevel::Info,
            format!("{} creation scheduled: {} ({})", r.kind, r.name, r.id),
            Self::ids(r),
        )
        .await;
    }

    pub async fn created(&self, r: &ResourceRef) {
        self.log(
            LogLevel::Audit,
            format!("{} created: {} ({})", r.kind, r.name, r.id),
            Self::ids(r),
        )
        .await;
    }

    pub async fn update_scheduled(&self, r: &ResourceRef) {
        self.log(
            LogLevel::Info,
            format!("{} update scheduled: {} ({})", r.kind, r.name, r.id),
            Self::ids(r),
        )
        .await;
    }

    pub async fn updated(&self, r: &ResourceRef, changed: &[&str]) {
        self.log(
            LogLevel::Audit,
            format!("{} updated: {} [{}]", r.kind, r.name, changed.join(", ")),
            Self::ids(r),
        )
        .await;
    }

    pub async fn deletion_scheduled(&self, r: &ResourceRef) {
        self.log(
            LogLevel::Info,
            format!("{} deletion scheduled: {} ({})", r.kind, r.name, r.id),
            Self::ids(r),
        )
        .await;
    }

    pub async fn deleted(&self, r: &ResourceRef) {
        self.log(
            LogLevel::Audit,
            format!("{} deleted: {} ({})", r.kind, r.name, r.id),
            Self::ids(r),
        )
        .await;
    }

    pub async fn erred(&self, r: &ResourceRef, message: &str) {
        self.log(
            LogLevel::Error,
            format!("{} {} failed: {}", r.kind, r.name, message),
            Self::ids(r),
        )
        .await;
    }

    // Reconciliation
    pub async fn imported(&self, r: &ResourceRef) {
        self.log(
            LogLevel::Audit,
            format!("{} imported from backend: {} ({})", r.kind, r.name, r.id),
            Self::ids(r),
        )
        .await;
    }

    pub async fn pulled(&self, r: &ResourceRef, changed: &[&str]) {
        self.log(
            LogLevel::Info,
            format!("{} pulled: {} [{}]", r.kind, r.name, changed.join(", ")),
            Self::ids(r),
        )
        .await;
    }

    pub async fn cleaned_from_cache(&self, r: &ResourceRef) {
        self.log(
            LogLevel::Audit,
            format!("{} cleaned from cache: {} ({})", r.kind, r.name, r.id),
            Self::ids(r),
        )
        .await;
    }

    pub async fn security_group_rule_removed(&self, group: &ResourceRef, rule: &SecurityGroupRule) {
        let ports = match (rule.from_port, rule.to_port) {
            (Some(from), Some(to)) => format!("{}-{}", from, to),
            _ => "any".to_string(),
        };
        self.log(
            LogLevel::Audit,
            format!(
                "Security group rule removed from {}: {} {} {} ports {} ({})",
                group.name,
                rule.direction,
                rule.ethertype,
                rule.protocol.as_deref().unwrap_or("any"),
                ports,
                rule.backend_id.as_deref().unwrap_or("-"),
            ),
            Self::ids(group),
        )
        .await;
    }

    // Peer permissions
    pub async fn permission_granted(&self, project_id: &str, username: &str, role: &str) {
        self.log(
            LogLevel::Audit,
            format!("Peer permission granted: {} as {} in {}", username, role, project_id),
            vec![project_id.to_string()],
        )
        .await;
    }

    pub async fn permission_revoked(&self, project_id: &str, username: &str) {
        self.log(
            LogLevel::Audit,
            format!("Peer permission revoked: {} in {}", username, project_id),
            vec![project_id.to_string()],
        )
        .await;
    }

    pub async fn permission_updated(&self, project_id: &str, username: &str, expires: &str) {
        self.log(
            LogLevel::Audit,
            format!(
                "Peer permission updated: {} in {} expires {}",
                username, project_id, expires
            ),
            vec![project_id.to_string()],
        )
        .await;
    }
}

/// Create a shared audit logger
pub fn create_audit_logger(log_endpoint: &str, component: &str) -> Arc<BrokerAuditLogger> {
    Arc::new(BrokerAuditLogger::new(log_endpoint, component))
}
