use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of an audit entry, syslog-ordered with an extra `Audit` level
/// for lifecycle actions taken on managed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warn,
    Notice,
    Info,
    Debug,
    Audit,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Emergency => "emergency",
            LogLevel::Alert => "alert",
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Audit => "audit",
        }
    }
}

/// One entry as shipped to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// ULID, sortable by creation time.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
    pub component: String,
    pub related_object_ids: Vec<String>,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        component: &str,
        message: String,
        related_object_ids: Vec<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            timestamp: Utc::now(),
            message,
            level,
            component: component.to_string(),
            related_object_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_serializes_lowercase() {
        let json = serde_json::to_string(&LogLevel::Audit).unwrap();
        assert_eq!(json, "\"audit\"");
        let back: LogLevel = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(back, LogLevel::Warn);
    }

    #[test]
    fn test_entry_ids_are_unique() {
        let a = LogEntry::new(LogLevel::Info, "engine", "a".into(), vec![]);
        let b = LogEntry::new(LogLevel::Info, "engine", "b".into(), vec![]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.component, "engine");
    }
}
