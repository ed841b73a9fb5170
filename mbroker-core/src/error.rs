//! Umbrella error for core operations.

use thiserror::Error;

use crate::quota::QuotaExceeded;
use crate::remote::BackendError;
use crate::state::InvalidTransition;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
