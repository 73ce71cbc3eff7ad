//! # Store
//!
//! Durable storage for enriched records, keyed by record id. Writes are conditional: a record
//! is stored at most once, so replaying a message can never produce a duplicate.
mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::EnrichedRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("invalid table name: {0}")]
    InvalidTableName(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed. Rejections of the data itself, data
    /// exceptions (SQLSTATE class 22) and integrity violations (class 23), never will.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::QueryError {
                error: sqlx::Error::Database(error),
                ..
            } => !error
                .code()
                .is_some_and(|code| code.starts_with("22") || code.starts_with("23")),
            StoreError::QueryError { .. } => true,
            StoreError::InvalidTableName(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same id was stored before. Not an error.
    AlreadyExists,
}

impl InsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsertOutcome::Inserted => "inserted",
            InsertOutcome::AlreadyExists => "already_exists",
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_if_absent(&self, record: &EnrichedRecord) -> Result<InsertOutcome, StoreError>;

    /// Up to `limit` records, in no particular order.
    async fn scan(&self, limit: usize) -> Result<Vec<EnrichedRecord>, StoreError>;

    async fn query_by_country(&self, country: &str) -> Result<Vec<EnrichedRecord>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<EnrichedRecord>, StoreError>;
}
