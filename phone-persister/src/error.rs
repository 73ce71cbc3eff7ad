use phone_common::store::StoreError;
use thiserror::Error;

/// A record could not be written. Transient failures are retried, anything else is dropped.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed to store record {id}: {error}")]
    StoreError { id: String, error: StoreError },
}

impl PersistError {
    pub fn is_transient(&self) -> bool {
        match self {
            PersistError::StoreError { error, .. } => error.is_transient(),
        }
    }
}
