use phone_common::queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to read candidates from {path}: {error}")]
    ReadError { path: String, error: std::io::Error },
    #[error("failed to serialize candidate {id}: {error}")]
    SerializeError {
        id: String,
        error: serde_json::Error,
    },
    #[error("failed to send candidate {id}: {error}")]
    SendError { id: String, error: QueueError },
}
