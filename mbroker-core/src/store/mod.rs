//! Persistence for resource records and project permissions.

mod error;
mod memory;
mod sqlite;
mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ImportBatchResult, PermissionStore, ResourceStore};

use crate::error::CoreError;
use crate::state::{InvalidTransition, Transition};
use crate::resource::ResourceRecord;

/// Load a record, apply `transition` and persist it.
///
/// A concurrent writer surfaces as [`InvalidTransition`] against the state
/// that writer left behind.
pub async fn transition(
    store: &dyn ResourceStore,
    id: &str,
    transition: Transition,
) -> crate::Result<ResourceRecord> {
    let record = store
        .get(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    save_transition(store, record, transition).await
}

/// Apply `transition` to an already loaded record and persist it.
pub async fn save_transition(
    store: &dyn ResourceStore,
    mut record: ResourceRecord,
    transition: Transition,
) -> crate::Result<ResourceRecord> {
    record.transition(transition)?;
    let id = record.id.clone();
    match store.update(record).await {
        Ok(saved) => Ok(saved),
        Err(StoreError::VersionMismatch { .. }) => {
            let current = store.get(&id).await?;
            Err(CoreError::InvalidTransition(InvalidTransition {
                resource_id: id,
                from: current.map(|r| r.state),
                transition,
            }))
        }
        Err(e) => Err(e.into()),
    }
}
