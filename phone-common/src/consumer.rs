//! # Consumer
//!
//! The receive, process, acknowledge loop shared by the enricher and the persister.
//!
//! Messages in a batch are handled concurrently and independently. Each message is
//! acknowledged right after its own handler asked for it, so a failing sibling never holds
//! back, or loses, a message that was processed successfully.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::{ComponentStatus, HealthHandle};
use crate::metrics::{
    CONSUMER_ACKNOWLEDGE_ERRORS, CONSUMER_BATCH_DURATION, CONSUMER_BATCH_SIZE,
    CONSUMER_RECEIVE_ERRORS,
};
use crate::queue::{
    validate_batch_size, Message, QueueClient, QueueError, QueueHandle, MAX_RECEIVE_BATCH,
};
use crate::retry::RetryPolicy;

/// Pause between empty receives when the queue is polled without waiting.
const IDLE_DELAY: time::Duration = time::Duration::from_secs(1);

/// What to do with a message once its handler is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The message's effects are durable, or it can never succeed: remove it.
    Acknowledge,
    /// Leave the message alone so it is redelivered after its visibility timeout.
    Retain,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Disposition;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_messages: usize,
    pub wait_time: time::Duration,
    /// Backoff applied when receiving from the queue keeps failing.
    pub retry_policy: RetryPolicy,
}

impl ConsumerSettings {
    /// Fails with `InvalidBatchSize` unless `max_messages` is within `1..=MAX_RECEIVE_BATCH`.
    pub fn new(
        max_messages: usize,
        wait_time: time::Duration,
        retry_policy: RetryPolicy,
    ) -> Result<Self, QueueError> {
        validate_batch_size(max_messages)?;
        Ok(Self {
            max_messages,
            wait_time,
            retry_policy,
        })
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_messages: MAX_RECEIVE_BATCH,
            wait_time: time::Duration::from_secs(10),
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub acknowledged: usize,
    pub retained: usize,
    pub acknowledge_errors: usize,
}

enum MessageResult {
    Acknowledged,
    Retained,
    AcknowledgeFailed,
}

pub struct Consumer<H> {
    /// Identifies this consumer in logs and metrics.
    name: String,
    queue: Arc<dyn QueueClient>,
    handle: QueueHandle,
    handler: H,
    settings: ConsumerSettings,
    liveness: HealthHandle,
}

impl<H: MessageHandler> Consumer<H> {
    pub fn new(
        name: &str,
        queue: Arc<dyn QueueClient>,
        handle: QueueHandle,
        handler: H,
        settings: ConsumerSettings,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            handle,
            handler,
            settings,
            liveness,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Receive a single batch and process it.
    pub async fn poll_once(&self) -> Result<BatchSummary, QueueError> {
        let messages = self
            .queue
            .receive_batch(
                &self.handle,
                self.settings.max_messages,
                self.settings.wait_time,
            )
            .await?;

        Ok(self.process_batch(messages).await)
    }

    /// Handle every message of a batch concurrently, acknowledging each one as soon as its
    /// handler asks for it.
    pub async fn process_batch(&self, messages: Vec<Message>) -> BatchSummary {
        let labels = [("consumer", self.name.clone())];
        let mut summary = BatchSummary {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return summary;
        }

        let start = time::Instant::now();
        metrics::histogram!(CONSUMER_BATCH_SIZE, &labels).record(messages.len() as f64);

        let results = join_all(messages.iter().map(|message| self.process_message(message))).await;
        for result in results {
            match result {
                MessageResult::Acknowledged => summary.acknowledged += 1,
                MessageResult::Retained => summary.retained += 1,
                MessageResult::AcknowledgeFailed => summary.acknowledge_errors += 1,
            }
        }

        metrics::histogram!(CONSUMER_BATCH_DURATION, &labels)
            .record(start.elapsed().as_secs_f64());
        debug!(
            consumer = %self.name,
            received = summary.received,
            acknowledged = summary.acknowledged,
            retained = summary.retained,
            "processed batch"
        );

        summary
    }

    async fn process_message(&self, message: &Message) -> MessageResult {
        match self.handler.handle(message).await {
            Disposition::Retain => MessageResult::Retained,
            Disposition::Acknowledge => {
                match self.queue.acknowledge(&self.handle, &message.receipt).await {
                    Ok(()) => MessageResult::Acknowledged,
                    Err(error) => {
                        // The message will be redelivered; handlers are idempotent.
                        warn!(
                            consumer = %self.name,
                            message_id = %message.message_id,
                            "failed to acknowledge message: {}",
                            error
                        );
                        metrics::counter!(
                            CONSUMER_ACKNOWLEDGE_ERRORS,
                            &[("consumer", self.name.clone())]
                        )
                        .increment(1);
                        MessageResult::AcknowledgeFailed
                    }
                }
            }
        }
    }

    /// Run until `shutdown` is cancelled. Cancellation is checked once per iteration, so a
    /// batch that was already received is always finished and acknowledged first.
    ///
    /// Transient receive errors are retried with backoff. Any other receive error marks the
    /// component unhealthy and is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
        let mut failed_receives: u32 = 0;
        info!(consumer = %self.name, queue = %self.handle.name, "starting consumer loop");

        while !shutdown.is_cancelled() {
            self.liveness.report_healthy();

            match self.poll_once().await {
                Ok(summary) => {
                    failed_receives = 0;
                    // A zero wait time turns every empty receive into a spin.
                    if summary.received == 0 && self.settings.wait_time.is_zero() {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(IDLE_DELAY) => {}
                        }
                    }
                }
                Err(error) if !error.is_transient() => {
                    error!(
                        consumer = %self.name,
                        queue = %self.handle.name,
                        "cannot receive messages, stopping: {}",
                        error
                    );
                    metrics::counter!(
                        CONSUMER_RECEIVE_ERRORS,
                        &[("consumer", self.name.clone())]
                    )
                    .increment(1);
                    self.liveness.report_status(ComponentStatus::Unhealthy);
                    return Err(error);
                }
                Err(error) => {
                    failed_receives = failed_receives.saturating_add(1);
                    let backoff = self.settings.retry_policy.backoff(failed_receives);
                    error!(
                        consumer = %self.name,
                        queue = %self.handle.name,
                        attempt = failed_receives,
                        "failed to receive messages, retrying in {:?}: {}",
                        backoff,
                        error
                    );
                    metrics::counter!(
                        CONSUMER_RECEIVE_ERRORS,
                        &[("consumer", self.name.clone())]
                    )
                    .increment(1);

                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(consumer = %self.name, "consumer loop stopped");
        Ok(())
    }
}
