use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use phone_common::config::FieldNames;
use phone_common::consumer::{Disposition, MessageHandler};
use phone_common::metrics::ENRICHER_MESSAGES;
use phone_common::normalizer::{Normalizer, RejectReason};
use phone_common::queue::{Message, QueueClient, QueueHandle, SendOutcome};
use phone_common::types::{CandidateBody, EnrichedRecord, MalformedError, RawCandidate};

use crate::error::EnrichError;

/// What happened to a candidate. Every outcome leads to acknowledging the intake message.
#[derive(Debug, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// The enriched record is on the output queue, or was already put there by an earlier
    /// delivery of the same candidate.
    Published { id: String, deduplicated: bool },
    Rejected { id: String, reason: RejectReason },
    Malformed(MalformedError),
}

impl EnrichOutcome {
    fn label(&self) -> &'static str {
        match self {
            EnrichOutcome::Published {
                deduplicated: false,
                ..
            } => "published",
            EnrichOutcome::Published {
                deduplicated: true, ..
            } => "deduplicated",
            EnrichOutcome::Rejected { .. } => "rejected",
            EnrichOutcome::Malformed(_) => "malformed",
        }
    }
}

/// Reads candidates, normalizes them, and publishes enriched records to the output queue.
pub struct Enricher {
    normalizer: Normalizer,
    fields: FieldNames,
    queue: Arc<dyn QueueClient>,
    output: QueueHandle,
    group_key: String,
}

impl Enricher {
    pub fn new(
        normalizer: Normalizer,
        fields: FieldNames,
        queue: Arc<dyn QueueClient>,
        output: QueueHandle,
        group_key: &str,
    ) -> Self {
        Self {
            normalizer,
            fields,
            queue,
            output,
            group_key: group_key.to_owned(),
        }
    }

    /// Enrich a single intake message. A transient `Err` means the message should be retried.
    pub async fn enrich(&self, message: &Message) -> Result<EnrichOutcome, EnrichError> {
        let candidate = match RawCandidate::from_body(&message.body, self.fields.as_slice()) {
            Ok(CandidateBody::Found(candidate)) => candidate,
            Ok(CandidateBody::MissingNumber { id }) => {
                return Ok(EnrichOutcome::Rejected {
                    id,
                    reason: RejectReason::MissingInput,
                })
            }
            Err(malformed) => return Ok(EnrichOutcome::Malformed(malformed)),
        };

        let fields = match self.normalizer.normalize(&candidate.raw) {
            Ok(fields) => fields,
            Err(reason) => {
                return Ok(EnrichOutcome::Rejected {
                    id: candidate.id,
                    reason,
                })
            }
        };

        let record = EnrichedRecord::new(candidate, fields, Utc::now());
        let body = serde_json::to_string(&record).map_err(|error| EnrichError::SerializeError {
            id: record.id.clone(),
            error,
        })?;

        // The record id doubles as the dedupe key: a redelivered candidate is not published twice.
        let sent = self
            .queue
            .send(&self.output, &body, &self.group_key, Some(&record.id))
            .await
            .map_err(|error| EnrichError::PublishError {
                id: record.id.clone(),
                queue: self.output.name.clone(),
                error,
            })?;

        Ok(EnrichOutcome::Published {
            id: record.id,
            deduplicated: sent == SendOutcome::Deduplicated,
        })
    }
}

#[async_trait]
impl MessageHandler for Enricher {
    async fn handle(&self, message: &Message) -> Disposition {
        match self.enrich(message).await {
            Ok(outcome) => {
                match &outcome {
                    EnrichOutcome::Published { .. } => {}
                    EnrichOutcome::Rejected { id, reason } => info!(
                        message_id = %message.message_id,
                        id = %id,
                        reason = reason.as_str(),
                        "rejected candidate"
                    ),
                    EnrichOutcome::Malformed(malformed) => error!(
                        message_id = %message.message_id,
                        "dropping malformed candidate: {}",
                        malformed
                    ),
                }
                metrics::counter!(ENRICHER_MESSAGES, &[("outcome", outcome.label())])
                    .increment(1);
                Disposition::Acknowledge
            }
            Err(error) if !error.is_transient() => {
                error!(
                    message_id = %message.message_id,
                    "dropping candidate that can never be enriched: {}",
                    error
                );
                metrics::counter!(ENRICHER_MESSAGES, &[("outcome", "dropped")]).increment(1);
                Disposition::Acknowledge
            }
            Err(error) => {
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "failed to enrich candidate, leaving it for redelivery: {}",
                    error
                );
                metrics::counter!(ENRICHER_MESSAGES, &[("outcome", "retained")]).increment(1);
                Disposition::Retain
            }
        }
    }
}
