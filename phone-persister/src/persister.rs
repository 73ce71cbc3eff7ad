use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use phone_common::consumer::{Disposition, MessageHandler};
use phone_common::metrics::PERSISTER_MESSAGES;
use phone_common::queue::Message;
use phone_common::store::{InsertOutcome, RecordStore};
use phone_common::types::{EnrichedRecord, MalformedError};

use crate::error::PersistError;

#[derive(Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored { id: String, outcome: InsertOutcome },
    Malformed(MalformedError),
}

impl PersistOutcome {
    fn label(&self) -> &'static str {
        match self {
            PersistOutcome::Stored { outcome, .. } => outcome.as_str(),
            PersistOutcome::Malformed(_) => "malformed",
        }
    }
}

/// Writes enriched records to the store, at most once per record id.
pub struct Persister {
    store: Arc<dyn RecordStore>,
}

impl Persister {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Persist a single output queue message. A transient `Err` means the message should be
    /// retried.
    pub async fn persist(&self, message: &Message) -> Result<PersistOutcome, PersistError> {
        let record = match EnrichedRecord::from_body(&message.body) {
            Ok(record) => record,
            Err(malformed) => return Ok(PersistOutcome::Malformed(malformed)),
        };

        let outcome = self
            .store
            .insert_if_absent(&record)
            .await
            .map_err(|error| PersistError::StoreError {
                id: record.id.clone(),
                error,
            })?;

        Ok(PersistOutcome::Stored {
            id: record.id,
            outcome,
        })
    }
}

#[async_trait]
impl MessageHandler for Persister {
    async fn handle(&self, message: &Message) -> Disposition {
        match self.persist(message).await {
            Ok(outcome) => {
                match &outcome {
                    PersistOutcome::Stored {
                        id,
                        outcome: InsertOutcome::Inserted,
                    } => debug!(message_id = %message.message_id, id = %id, "stored record"),
                    PersistOutcome::Stored {
                        id,
                        outcome: InsertOutcome::AlreadyExists,
                    } => info!(
                        message_id = %message.message_id,
                        id = %id,
                        "record was already stored"
                    ),
                    PersistOutcome::Malformed(malformed) => error!(
                        message_id = %message.message_id,
                        "dropping malformed record: {}",
                        malformed
                    ),
                }
                metrics::counter!(PERSISTER_MESSAGES, &[("outcome", outcome.label())])
                    .increment(1);
                Disposition::Acknowledge
            }
            Err(error) if !error.is_transient() => {
                error!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "dropping record the store will never accept: {}",
                    error
                );
                metrics::counter!(PERSISTER_MESSAGES, &[("outcome", "dropped")]).increment(1);
                Disposition::Acknowledge
            }
            Err(error) => {
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "failed to persist record, leaving it for redelivery: {}",
                    error
                );
                metrics::counter!(PERSISTER_MESSAGES, &[("outcome", "retained")]).increment(1);
                Disposition::Retain
            }
        }
    }
}
