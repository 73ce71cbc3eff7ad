use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    validate_batch_size, Message, QueueClient, QueueError, QueueHandle, ReceiptToken,
    SendOutcome,
};

struct StoredMessage {
    id: u64,
    group_key: String,
    body: String,
    receipt: Option<ReceiptToken>,
    receive_count: u32,
    visible_at: Instant,
}

struct QueueState {
    handle: QueueHandle,
    next_id: u64,
    /// Kept in send order, which is also id order.
    messages: VecDeque<StoredMessage>,
    dedupe: HashMap<String, Instant>,
}

impl QueueState {
    fn take_visible(&mut self, max_messages: usize, now: Instant) -> Vec<Message> {
        let mut blocked_groups: HashSet<String> = HashSet::new();
        let mut received = Vec::new();

        for message in self.messages.iter_mut() {
            if received.len() == max_messages {
                break;
            }
            if blocked_groups.contains(&message.group_key) {
                continue;
            }
            if message.visible_at > now {
                // An in-flight message holds back the rest of its group.
                _ = blocked_groups.insert(message.group_key.clone());
                continue;
            }

            let receipt = ReceiptToken(Uuid::new_v4().to_string());
            message.receipt = Some(receipt.clone());
            message.receive_count += 1;
            message.visible_at = now + self.handle.visibility_timeout;

            received.push(Message {
                message_id: message.id.to_string(),
                group_key: message.group_key.clone(),
                body: message.body.clone(),
                receipt,
                receive_count: message.receive_count,
            });
        }

        received
    }

    /// The next instant at which an in-flight message becomes visible again, if any.
    fn next_visible_at(&self, now: Instant) -> Option<Instant> {
        self.messages
            .iter()
            .map(|m| m.visible_at)
            .filter(|visible_at| *visible_at > now)
            .min()
    }
}

/// A queue living in process memory, with the same delivery semantics as `PgQueue`.
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue, or return the existing one unchanged.
    pub fn create_queue(
        &self,
        name: &str,
        visibility_timeout: Duration,
        dedupe_window: Duration,
    ) -> QueueHandle {
        let mut queues = self.queues.lock();
        queues
            .entry(name.to_owned())
            .or_insert_with(|| QueueState {
                handle: QueueHandle {
                    name: name.to_owned(),
                    visibility_timeout,
                    dedupe_window,
                },
                next_id: 1,
                messages: VecDeque::new(),
                dedupe: HashMap::new(),
            })
            .handle
            .clone()
    }

    /// Number of messages still in the queue, in flight or not.
    pub fn depth(&self, name: &str) -> usize {
        self.queues
            .lock()
            .get(name)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    /// Number of messages currently received and not yet visible again.
    pub fn in_flight(&self, name: &str) -> usize {
        let now = Instant::now();
        self.queues
            .lock()
            .get(name)
            .map(|queue| {
                queue
                    .messages
                    .iter()
                    .filter(|m| m.visible_at > now)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn resolve_queue(&self, name: &str) -> Result<QueueHandle, QueueError> {
        self.queues
            .lock()
            .get(name)
            .map(|queue| queue.handle.clone())
            .ok_or_else(|| QueueError::NotFound(name.to_owned()))
    }

    async fn receive_batch(
        &self,
        queue: &QueueHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        validate_batch_size(max_messages)?;
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before looking, so a send racing with us is not missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let now = Instant::now();
            let wake_at = {
                let mut queues = self.queues.lock();
                let state = queues
                    .get_mut(&queue.name)
                    .ok_or_else(|| QueueError::NotFound(queue.name.clone()))?;

                let received = state.take_visible(max_messages, now);
                if !received.is_empty() {
                    return Ok(received);
                }
                if now >= deadline {
                    return Ok(Vec::new());
                }

                state
                    .next_visible_at(now)
                    .map_or(deadline, |visible_at| visible_at.min(deadline))
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn send(
        &self,
        queue: &QueueHandle,
        body: &str,
        group_key: &str,
        dedupe_key: Option<&str>,
    ) -> Result<SendOutcome, QueueError> {
        let now = Instant::now();
        {
            let mut queues = self.queues.lock();
            let state = queues
                .get_mut(&queue.name)
                .ok_or_else(|| QueueError::NotFound(queue.name.clone()))?;

            if let Some(key) = dedupe_key {
                match state.dedupe.get(key) {
                    Some(expires_at) if *expires_at > now => {
                        return Ok(SendOutcome::Deduplicated)
                    }
                    _ => {
                        let window = state.handle.dedupe_window;
                        state.dedupe.retain(|_, expires_at| *expires_at > now);
                        _ = state.dedupe.insert(key.to_owned(), now + window);
                    }
                }
            }

            let id = state.next_id;
            state.next_id += 1;
            state.messages.push_back(StoredMessage {
                id,
                group_key: group_key.to_owned(),
                body: body.to_owned(),
                receipt: None,
                receive_count: 0,
                visible_at: now,
            });
        }

        self.notify.notify_waiters();
        Ok(SendOutcome::Sent)
    }

    async fn acknowledge(
        &self,
        queue: &QueueHandle,
        receipt: &ReceiptToken,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(&queue.name)
            .ok_or_else(|| QueueError::NotFound(queue.name.clone()))?;

        let position = state
            .messages
            .iter()
            .position(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::StaleReceipt(receipt.to_string()))?;
        drop(state.messages.remove(position));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn queue_with(name: &str) -> (MemoryQueue, QueueHandle) {
        let queue = MemoryQueue::new();
        let handle = queue.create_queue(name, VISIBILITY, Duration::from_secs(300));
        (queue, handle)
    }

    #[tokio::test]
    async fn test_resolve_unknown_queue() {
        let queue = MemoryQueue::new();

        assert!(matches!(
            queue.resolve_queue("nope.fifo").await,
            Err(QueueError::NotFound(name)) if name == "nope.fifo"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_empty() {
        let (queue, handle) = queue_with("numbers.fifo");
        let start = Instant::now();

        let messages = queue
            .receive_batch(&handle, 10, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(messages.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_up_on_send() {
        let (queue, handle) = queue_with("numbers.fifo");
        let queue = Arc::new(queue);

        let receiver = {
            let queue = queue.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                queue
                    .receive_batch(&handle, 10, Duration::from_secs(10))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.send(&handle, "hello", "g", None).await.unwrap();

        let messages = receiver.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[0].receive_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_reappears_after_visibility_timeout() {
        let (queue, handle) = queue_with("numbers.fifo");
        queue.send(&handle, "hello", "g", None).await.unwrap();

        let first = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(queue.in_flight("numbers.fifo"), 1);

        let hidden = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(hidden.is_empty());

        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;

        let second = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt, first[0].receipt);

        // The first receipt was superseded by the redelivery.
        assert!(matches!(
            queue.acknowledge(&handle, &first[0].receipt).await,
            Err(QueueError::StaleReceipt(_))
        ));
        queue.acknowledge(&handle, &second[0].receipt).await.unwrap();
        assert_eq!(queue.depth("numbers.fifo"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_up_when_message_becomes_visible() {
        let (queue, handle) = queue_with("numbers.fifo");
        queue.send(&handle, "hello", "g", None).await.unwrap();
        let first = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let start = Instant::now();
        let again = queue
            .receive_batch(&handle, 10, VISIBILITY * 2)
            .await
            .unwrap();

        assert_eq!(again.len(), 1);
        assert!(start.elapsed() < VISIBILITY * 2);
    }

    #[tokio::test]
    async fn test_group_is_held_back_while_a_message_is_in_flight() {
        let (queue, handle) = queue_with("numbers.fifo");
        queue.send(&handle, "a1", "a", None).await.unwrap();
        queue.send(&handle, "a2", "a", None).await.unwrap();
        queue.send(&handle, "b1", "b", None).await.unwrap();

        let first = queue
            .receive_batch(&handle, 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first[0].body, "a1");

        // a2 must wait for a1 to be acknowledged, b1 is free to go.
        let second = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        let bodies: Vec<&str> = second.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["b1"]);

        queue.acknowledge(&handle, &first[0].receipt).await.unwrap();
        let third = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        let bodies: Vec<&str> = third.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["a2"]);
    }

    #[tokio::test]
    async fn test_batch_preserves_group_order() {
        let (queue, handle) = queue_with("numbers.fifo");
        for i in 0..5 {
            queue
                .send(&handle, &format!("m{i}"), "numbers", None)
                .await
                .unwrap();
        }

        let messages = queue
            .receive_batch(&handle, 3, Duration::ZERO)
            .await
            .unwrap();
        let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();

        assert_eq!(bodies, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedupe_key_suppresses_sends_within_window() {
        let (queue, handle) = queue_with("enriched.fifo");

        assert_eq!(
            queue.send(&handle, "one", "g", Some("id-1")).await.unwrap(),
            SendOutcome::Sent
        );
        assert_eq!(
            queue.send(&handle, "two", "g", Some("id-1")).await.unwrap(),
            SendOutcome::Deduplicated
        );
        assert_eq!(queue.depth("enriched.fifo"), 1);

        tokio::time::advance(Duration::from_secs(301)).await;

        assert_eq!(
            queue.send(&handle, "three", "g", Some("id-1")).await.unwrap(),
            SendOutcome::Sent
        );
        assert_eq!(queue.depth("enriched.fifo"), 2);
    }

    #[tokio::test]
    async fn test_invalid_batch_size() {
        let (queue, handle) = queue_with("numbers.fifo");

        assert!(matches!(
            queue.receive_batch(&handle, 11, Duration::ZERO).await,
            Err(QueueError::InvalidBatchSize(11))
        ));
    }
}
