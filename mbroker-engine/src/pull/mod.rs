//! Reconciliation of local records against remote collections.

mod engine;
mod scheduler;

pub use engine::{ReconcileReport, ReconciliationEngine, ScopeKey, apply_quotas};
pub use scheduler::{RECONCILE_ORDER, ReconciliationScheduler, SchedulerHandle};
