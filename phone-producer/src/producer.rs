use std::io::BufRead;
use std::sync::Arc;

use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use phone_common::metrics::PRODUCER_MESSAGES;
use phone_common::queue::{QueueClient, QueueHandle, SendOutcome};
use phone_common::types::RawCandidate;

use crate::error::ProduceError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProduceSummary {
    pub sent: usize,
    pub deduplicated: usize,
}

/// Publishes raw candidates to the intake queue, all under one ordering group.
pub struct Producer {
    queue: Arc<dyn QueueClient>,
    handle: QueueHandle,
    group_key: String,
}

impl Producer {
    pub fn new(queue: Arc<dyn QueueClient>, handle: QueueHandle, group_key: &str) -> Self {
        Self {
            queue,
            handle,
            group_key: group_key.to_owned(),
        }
    }

    /// Give each raw value a fresh, time-ordered id and publish it.
    pub async fn publish_raws<I>(&self, raws: I) -> Result<ProduceSummary, ProduceError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut summary = ProduceSummary::default();

        // Sent one at a time: send order is the delivery order within the group.
        for raw in raws {
            let candidate = RawCandidate {
                id: Uuid::now_v7().to_string(),
                raw,
            };
            match self.publish(&candidate).await? {
                SendOutcome::Sent => summary.sent += 1,
                SendOutcome::Deduplicated => summary.deduplicated += 1,
            }
        }

        Ok(summary)
    }

    /// Publish a single candidate, using its id as the dedupe key.
    pub async fn publish(&self, candidate: &RawCandidate) -> Result<SendOutcome, ProduceError> {
        let body = serde_json::to_string(candidate).map_err(|error| ProduceError::SerializeError {
            id: candidate.id.clone(),
            error,
        })?;

        let outcome = self
            .queue
            .send(&self.handle, &body, &self.group_key, Some(&candidate.id))
            .await
            .map_err(|error| ProduceError::SendError {
                id: candidate.id.clone(),
                error,
            })?;

        debug!(id = %candidate.id, outcome = ?outcome, "published candidate");
        metrics::counter!(PRODUCER_MESSAGES).increment(1);

        Ok(outcome)
    }
}

/// Random 10-digit numbers, the first digit never being zero.
pub fn random_raws<R: Rng>(rng: &mut R, count: usize) -> Vec<String> {
    (0..count)
        .map(|_| rng.gen_range(1_000_000_000u64..10_000_000_000u64).to_string())
        .collect()
}

/// One candidate per line. Blank lines are skipped and surrounding whitespace is trimmed.
pub fn read_raws<R: BufRead>(reader: R) -> Result<Vec<String>, std::io::Error> {
    let mut raws = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let raw = line.trim();
        if !raw.is_empty() {
            raws.push(raw.to_owned());
        }
    }
    Ok(raws)
}
