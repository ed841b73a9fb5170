//! Lifecycle orchestration: task chains built by the executor, run by a
//! worker pool against a [`Backend`], and reconciliation of local records
//! against remote collections.

pub mod backend;
pub mod chain;
pub mod error;
pub mod executor;
pub mod pool;
pub mod pull;
pub mod quotas;
pub mod runner;
pub mod task;
pub mod test_util;
pub mod throttle;

pub use backend::{Backend, BackendMethod, BackendOutput, RemoteQuota};
pub use chain::{Operation, TaskChain};
pub use error::ChainError;
pub use executor::{CreateOptions, DeleteOptions, Executor};
pub use pool::{ChainHandle, WorkerPool};
pub use pull::{
    RECONCILE_ORDER, ReconcileReport, ReconciliationEngine, ReconciliationScheduler,
    SchedulerHandle, ScopeKey,
};
pub use runner::{ChainOutcome, ChainRunner};
pub use task::{PollSpec, Task, TaskKind};
pub use throttle::{ProvisionThrottle, ThrottlePermit};
