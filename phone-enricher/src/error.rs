use phone_common::queue::QueueError;
use thiserror::Error;

/// Errors that prevent a candidate from being enriched.
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("failed to serialize record {id}: {error}")]
    SerializeError {
        id: String,
        error: serde_json::Error,
    },
    #[error("failed to publish record {id} to {queue}: {error}")]
    PublishError {
        id: String,
        queue: String,
        error: QueueError,
    },
}

impl EnrichError {
    /// Whether a later delivery of the same candidate may succeed. Failed publishes always
    /// count as transient.
    pub fn is_transient(&self) -> bool {
        match self {
            EnrichError::SerializeError { .. } => false,
            EnrichError::PublishError { .. } => true,
        }
    }
}
