use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    validate_batch_size, Message, QueueClient, QueueError, QueueHandle, ReceiptToken,
    SendOutcome,
};

#[derive(sqlx::FromRow)]
struct QueueRow {
    name: String,
    visibility_timeout_seconds: i32,
    dedupe_window_seconds: i32,
}

impl From<QueueRow> for QueueHandle {
    fn from(row: QueueRow) -> Self {
        QueueHandle {
            name: row.name,
            visibility_timeout: Duration::from_secs(row.visibility_timeout_seconds.max(1) as u64),
            dedupe_window: Duration::from_secs(row.dedupe_window_seconds.max(0) as u64),
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    group_key: String,
    body: String,
    receipt: Uuid,
    receive_count: i32,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            message_id: row.id.to_string(),
            group_key: row.group_key,
            body: row.body,
            receipt: ReceiptToken(row.receipt.to_string()),
            receive_count: row.receive_count.max(0) as u32,
        }
    }
}

/// A queue backed by the `queue_messages` table in PostgreSQL.
///
/// A message is in flight while its `visible_at` lies in the future. Receives take a
/// transaction-scoped advisory lock on the queue name, so two consumers never interleave
/// their view of a group.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    /// How often to look again for new messages while long-polling.
    poll_interval: Duration,
}

impl PgQueue {
    pub fn from_pool(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    /// Register a queue, or update the settings of an existing one.
    pub async fn create_queue(
        &self,
        name: &str,
        visibility_timeout: Duration,
        dedupe_window: Duration,
    ) -> Result<QueueHandle, QueueError> {
        let query = r#"
INSERT INTO queues (name, visibility_timeout_seconds, dedupe_window_seconds)
VALUES ($1, $2, $3)
ON CONFLICT (name) DO UPDATE
SET
    visibility_timeout_seconds = EXCLUDED.visibility_timeout_seconds,
    dedupe_window_seconds = EXCLUDED.dedupe_window_seconds
RETURNING name, visibility_timeout_seconds, dedupe_window_seconds
        "#;

        let row: QueueRow = sqlx::query_as(query)
            .bind(name)
            .bind(i32::try_from(visibility_timeout.as_secs().max(1)).unwrap_or(i32::MAX))
            .bind(i32::try_from(dedupe_window.as_secs()).unwrap_or(i32::MAX))
            .fetch_one(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(row.into())
    }

    async fn try_receive(
        &self,
        queue: &QueueHandle,
        max_messages: usize,
    ) -> Result<Vec<Message>, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&queue.name)
            .execute(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        // A message is eligible when it is visible and no earlier message of its group is in
        // flight.
        let query = r#"
WITH next_messages AS (
    SELECT
        m.id
    FROM
        queue_messages m
    WHERE
        m.queue = $1
        AND m.visible_at <= NOW()
        AND NOT EXISTS (
            SELECT 1
            FROM queue_messages earlier
            WHERE
                earlier.queue = m.queue
                AND earlier.group_key = m.group_key
                AND earlier.id < m.id
                AND earlier.visible_at > NOW()
        )
    ORDER BY
        m.id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    queue_messages
SET
    receipt = gen_random_uuid(),
    receive_count = queue_messages.receive_count + 1,
    visible_at = NOW() + make_interval(secs => $3)
FROM
    next_messages
WHERE
    queue_messages.id = next_messages.id
RETURNING
    queue_messages.id,
    queue_messages.group_key,
    queue_messages.body,
    queue_messages.receipt,
    queue_messages.receive_count
        "#;

        let mut rows: Vec<MessageRow> = sqlx::query_as(query)
            .bind(&queue.name)
            .bind(max_messages as i64)
            .bind(queue.visibility_timeout.as_secs_f64())
            .fetch_all(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit()
            .await
            .map_err(|error| QueueError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        // RETURNING gives no ordering guarantee.
        rows.sort_by_key(|row| row.id);
        Ok(rows.into_iter().map(Message::from).collect())
    }
}

#[async_trait]
impl QueueClient for PgQueue {
    async fn resolve_queue(&self, name: &str) -> Result<QueueHandle, QueueError> {
        let row: Option<QueueRow> = sqlx::query_as(
            "SELECT name, visibility_timeout_seconds, dedupe_window_seconds FROM queues WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        row.map(QueueHandle::from)
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
            let messages = self.try_receive(queue, max_messages).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(messages);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn send(
        &self,
        queue: &QueueHandle,
        body: &str,
        group_key: &str,
        dedupe_key: Option<&str>,
    ) -> Result<SendOutcome, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        if let Some(dedupe_key) = dedupe_key {
            sqlx::query("DELETE FROM queue_deduplication WHERE queue = $1 AND expires_at <= NOW()")
                .bind(&queue.name)
                .execute(&mut *tx)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "DELETE".to_owned(),
                    error,
                })?;

            // Claims the key unless an unexpired claim already exists.
            let query = r#"
INSERT INTO queue_deduplication (queue, dedupe_key, expires_at)
VALUES ($1, $2, NOW() + make_interval(secs => $3))
ON CONFLICT (queue, dedupe_key) DO UPDATE
SET expires_at = EXCLUDED.expires_at
WHERE queue_deduplication.expires_at <= NOW()
            "#;

            let claimed = sqlx::query(query)
                .bind(&queue.name)
                .bind(dedupe_key)
                .bind(queue.dedupe_window.as_secs_f64())
                .execute(&mut *tx)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                })?
                .rows_affected();

            if claimed == 0 {
                tx.rollback()
                    .await
                    .map_err(|error| QueueError::TransactionError {
                        command: "ROLLBACK".to_owned(),
                        error,
                    })?;
                return Ok(SendOutcome::Deduplicated);
            }
        }

        sqlx::query("INSERT INTO queue_messages (queue, group_key, body) VALUES ($1, $2, $3)")
            .bind(&queue.name)
            .bind(group_key)
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        tx.commit()
            .await
            .map_err(|error| QueueError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(SendOutcome::Sent)
    }

    async fn acknowledge(
        &self,
        queue: &QueueHandle,
        receipt: &ReceiptToken,
    ) -> Result<(), QueueError> {
        let Ok(receipt_id) = Uuid::parse_str(&receipt.0) else {
            return Err(QueueError::StaleReceipt(receipt.to_string()));
        };

        let deleted = sqlx::query("DELETE FROM queue_messages WHERE queue = $1 AND receipt = $2")
            .bind(&queue.name)
            .bind(receipt_id)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?
            .rows_affected();

        if deleted == 0 {
            return Err(QueueError::StaleReceipt(receipt.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn numbers_queue(queue: &PgQueue) -> QueueHandle {
        queue
            .create_queue(
                "test_numbers.fifo",
                Duration::from_secs(30),
                Duration::from_secs(300),
            )
            .await
            .expect("failed to create queue")
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn test_resolve_seeded_and_missing_queues(db: PgPool) {
        let queue = PgQueue::from_pool(db, Duration::from_millis(10));

        let handle = queue.resolve_queue("numbers.fifo").await.unwrap();
        assert_eq!(handle.visibility_timeout, Duration::from_secs(30));

        assert!(matches!(
            queue.resolve_queue("missing.fifo").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn test_send_receive_acknowledge(db: PgPool) {
        let queue = PgQueue::from_pool(db, Duration::from_millis(10));
        let handle = numbers_queue(&queue).await;

        queue.send(&handle, "m0", "numbers", None).await.unwrap();
        queue.send(&handle, "m1", "numbers", None).await.unwrap();

        let messages = queue
            .receive_batch(&handle, 10, Duration::from_millis(100))
            .await
            .unwrap();
        let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m0", "m1"]);
        assert!(messages.iter().all(|m| m.receive_count == 1));

        // Still in flight.
        let again = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());

        for message in &messages {
            queue.acknowledge(&handle, &message.receipt).await.unwrap();
        }
        assert!(matches!(
            queue.acknowledge(&handle, &messages[0].receipt).await,
            Err(QueueError::StaleReceipt(_))
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn test_in_flight_message_holds_back_its_group(db: PgPool) {
        let queue = PgQueue::from_pool(db, Duration::from_millis(10));
        let handle = numbers_queue(&queue).await;

        queue.send(&handle, "a1", "a", None).await.unwrap();
        queue.send(&handle, "a2", "a", None).await.unwrap();
        queue.send(&handle, "b1", "b", None).await.unwrap();

        let first = queue
            .receive_batch(&handle, 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first[0].body, "a1");

        let second = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        let bodies: Vec<&str> = second.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["b1"]);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn test_unacknowledged_message_is_redelivered(db: PgPool) {
        let queue = PgQueue::from_pool(db, Duration::from_millis(10));
        let handle = queue
            .create_queue("test_short.fifo", Duration::from_secs(1), Duration::ZERO)
            .await
            .unwrap();

        queue.send(&handle, "hello", "g", None).await.unwrap();
        let first = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = queue
            .receive_batch(&handle, 10, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].receive_count, 2);

        assert!(matches!(
            queue.acknowledge(&handle, &first[0].receipt).await,
            Err(QueueError::StaleReceipt(_))
        ));
        queue.acknowledge(&handle, &second[0].receipt).await.unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn test_dedupe_key_suppresses_duplicate_sends(db: PgPool) {
        let queue = PgQueue::from_pool(db, Duration::from_millis(10));
        let handle = numbers_queue(&queue).await;

        assert_eq!(
            queue.send(&handle, "one", "g", Some("id-1")).await.unwrap(),
            SendOutcome::Sent
        );
        assert_eq!(
            queue.send(&handle, "two", "g", Some("id-1")).await.unwrap(),
            SendOutcome::Deduplicated
        );

        let messages = queue
            .receive_batch(&handle, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "one");
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn test_send_prunes_expired_dedupe_keys(db: PgPool) {
        let queue = PgQueue::from_pool(db.clone(), Duration::from_millis(10));
        let handle = numbers_queue(&queue).await;

        sqlx::query(
            "INSERT INTO queue_deduplication (queue, dedupe_key, expires_at) VALUES ($1, 'old', NOW() - INTERVAL '1 second')",
        )
        .bind(&handle.name)
        .execute(&db)
        .await
        .unwrap();

        queue.send(&handle, "one", "g", Some("new")).await.unwrap();

        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT dedupe_key FROM queue_deduplication WHERE queue = $1 ORDER BY dedupe_key",
        )
        .bind(&handle.name)
        .fetch_all(&db)
        .await
        .unwrap();
        assert_eq!(keys, vec!["new".to_owned()]);
    }
}
