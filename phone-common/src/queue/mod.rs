//! # Queue
//!
//! A FIFO, at-least-once message queue. Messages are ordered within a group key only, stay
//! invisible for the queue's visibility timeout once received, and reappear if they are not
//! acknowledged in time.
mod memory;
mod pg;

pub use memory::MemoryQueue;
pub use pg::PgQueue;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Upper bound on the number of messages a single receive may return.
pub const MAX_RECEIVE_BATCH: usize = 10;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue {0} does not exist")]
    NotFound(String),
    #[error("cannot receive {0} messages at once: must be between 1 and {max}", max = MAX_RECEIVE_BATCH)]
    InvalidBatchSize(usize),
    #[error("receipt {0} is no longer valid: the message was acknowledged or redelivered")]
    StaleReceipt(String),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

impl QueueError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::QueryError { .. } | QueueError::TransactionError { .. }
        )
    }
}

/// A resolved queue, along with the settings that were read when resolving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub visibility_timeout: Duration,
    pub dedupe_window: Duration,
}

/// Opaque token proving a consumer currently holds a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptToken(pub String);

impl std::fmt::Display for ReceiptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: String,
    pub group_key: String,
    pub body: String,
    pub receipt: ReceiptToken,
    /// How many times this message was received, this delivery included.
    pub receive_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// A message with the same dedupe key was sent within the dedupe window.
    Deduplicated,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn resolve_queue(&self, name: &str) -> Result<QueueHandle, QueueError>;

    /// Long-poll for up to `max_messages` messages, waiting at most `wait`. Returns an empty
    /// vector when nothing became available in time.
    async fn receive_batch(
        &self,
        queue: &QueueHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, QueueError>;

    async fn send(
        &self,
        queue: &QueueHandle,
        body: &str,
        group_key: &str,
        dedupe_key: Option<&str>,
    ) -> Result<SendOutcome, QueueError>;

    /// Remove a received message. Callers must only acknowledge once the message's effects
    /// are durable.
    async fn acknowledge(
        &self,
        queue: &QueueHandle,
        receipt: &ReceiptToken,
    ) -> Result<(), QueueError>;
}

pub(crate) fn validate_batch_size(max_messages: usize) -> Result<(), QueueError> {
    if (1..=MAX_RECEIVE_BATCH).contains(&max_messages) {
        Ok(())
    } else {
        Err(QueueError::InvalidBatchSize(max_messages))
    }
}
