//! mbroker-log client library
//!
//! Shared audit logger for all mbroker components. Every entry is written to
//! the local `audit` tracing target and, when an endpoint is configured,
//! forwarded as JSON to the external event log.
//!
//! # Example
//! ```ignore
//! use mbroker_log::{LogLevel, create_audit_logger};
//!
//! let audit = create_audit_logger("http://[::1]:50052", "engine");
//! audit.log(LogLevel::Audit, "Tenant created", vec![tenant_id]).await;
//! ```

mod audit;
pub mod entry;

pub use audit::{AuditLogger, create_audit_logger};
pub use entry::{LogEntry, LogLevel};
