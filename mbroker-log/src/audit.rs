//! Audit logging to the external event log
//!
//! Non-blocking and fault-tolerant: if the event log is unavailable, entries
//! are logged locally via tracing and discarded.

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{LogEntry, LogLevel};

/// Audit logger client for the event log
pub struct AuditLogger {
    client: RwLock<Option<reqwest::Client>>,
    log_endpoint: String,
    component: String,
    /// Entries kept in memory when created with `new_recording`.
    recorded: Option<Mutex<Vec<LogEntry>>>,
}

impl AuditLogger {
    /// Create a new audit logger for a specific component
    pub fn new(log_endpoint: &str, component: &str) -> Self {
        Self {
            client: RwLock::new(None),
            log_endpoint: log_endpoint.trim_end_matches('/').to_string(),
            component: component.to_string(),
            recorded: None,
        }
    }

    /// Create a noop audit logger (for testing)
    /// Uses an empty endpoint so ensure_connected() never builds a client
    pub fn new_noop() -> Self {
        Self::new("", "")
    }

    /// Create a logger that keeps every entry in memory instead of forwarding.
    pub fn new_recording(component: &str) -> Self {
        Self {
            recorded: Some(Mutex::new(Vec::new())),
            ..Self::new("", component)
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Entries captured by a recording logger, oldest first.
    pub async fn entries(&self) -> Vec<LogEntry> {
        match &self.recorded {
            Some(recorded) => recorded.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Build the HTTP client (lazy, on first log)
    async fn ensure_connected(&self) -> Option<reqwest::Client> {
        if self.log_endpoint.is_empty() {
            return None;
        }

        {
            let client = self.client.read().await;
            if client.is_some() {
                return client.clone();
            }
        }

        let mut client = self.client.write().await;
        if client.is_none() {
            match reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
            {
                Ok(c) => {
                    debug!(endpoint = %self.log_endpoint, "Audit forwarding enabled");
                    *client = Some(c);
                }
                Err(e) => {
                    debug!(error = %e, "Failed to build event log client (audit logs disabled)");
                    return None;
                }
            }
        }
        client.clone()
    }

    /// Log an audit event
    ///
    /// Events are always logged locally via tracing, and forwarded if an
    /// endpoint is configured.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>, object_ids: Vec<String>) {
        let message = message.into();

        match level {
            LogLevel::Emergency | LogLevel::Alert | LogLevel::Critical | LogLevel::Error => {
                tracing::error!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Notice | LogLevel::Audit | LogLevel::Info => {
                tracing::info!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
        }

        let entry = LogEntry::new(level, &self.component, message, object_ids);

        if let Some(recorded) = &self.recorded {
            recorded.lock().await.push(entry);
            return;
        }

        if let Some(client) = self.ensure_connected().await {
            let url = format!("{}/entries", self.log_endpoint);
            match client.post(&url).json(&entry).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(status = %resp.status(), "Event log rejected audit entry");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to send audit entry to event log");
                    // Drop client so the next entry rebuilds it
                    *self.client.write().await = None;
                }
            }
        }
    }
}

/// Create a shared audit logger
pub fn create_audit_logger(log_endpoint: &str, component: &str) -> Arc<AuditLogger> {
    Arc::new(AuditLogger::new(log_endpoint, component))
}
