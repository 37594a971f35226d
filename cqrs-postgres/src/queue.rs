//! `PostgreSQL`-backed [`Queue`].
//!
//! Built on the same `FOR UPDATE SKIP LOCKED` competing-consumer idiom as
//! [`crate::event_store::PostgresEventStore`] rather than a dedicated
//! pub/sub library. Each topic gets its own table (`queue_messages` for the
//! default `"messages"` topic, `queue_failures` for the poison topic),
//! matching the reference's per-topic `MessagesTable(topic)` naming — the
//! poison topic is realized with exactly the same publish/subscribe
//! mechanism as the primary one, just pointed at a different table, never a
//! structurally different dead-letter schema.

use chrono::{DateTime, Utc};
use cqrs_core::context::QueueContext;
use cqrs_core::queue::{Queue, QueueError, QueueHandler, QueueMessage};
use cqrs_runtime::RetryPolicy;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Metadata key the retry middleware stamps onto a message before routing it
/// to the poison topic, recording the last handler error.
const FAILURE_REASON_KEY: &str = "x-failure-reason";

/// How long `subscribe` sleeps when there is nothing left to claim.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A `PostgreSQL`-backed [`Queue`] for a single topic.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    topic: String,
    poison_topic: String,
    retry_policy: RetryPolicy,
}

impl PostgresQueue {
    /// Connect to `database_url` and ensure the schema exists, for messages
    /// on `topic`.
    ///
    /// # Errors
    ///
    /// [`QueueError::SubscribeFailed`] if the connection or schema setup
    /// fails.
    pub async fn connect(database_url: &str, topic: impl Into<String>) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        Self::from_pool(pool, topic).await
    }

    /// Wrap an existing pool, ensuring the schema exists, for messages on
    /// `topic`.
    ///
    /// # Errors
    ///
    /// [`QueueError::SubscribeFailed`] if schema setup fails, or if `topic`
    /// or the default poison topic name aren't valid table-name components.
    pub async fn from_pool(pool: PgPool, topic: impl Into<String>) -> Result<Self, QueueError> {
        let store = Self {
            pool,
            topic: topic.into(),
            poison_topic: "failures".to_string(),
            retry_policy: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_secs(2))
                .multiplier(2.0)
                .build(),
        };
        store.ensure_table(&store.topic).await?;
        store.ensure_table(&store.poison_topic).await?;
        Ok(store)
    }

    /// Override the retry policy governing how many times a failed message
    /// is redelivered (with backoff) before it's routed to the poison topic.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the topic name messages are routed to once retries are
    /// exhausted (defaults to `"failures"`, matching [`Queue::poison_topic`]'s
    /// default). Must be called before the queue is used, since it changes
    /// which table the poison table migration targets.
    ///
    /// # Errors
    ///
    /// [`QueueError::SubscribeFailed`] if the new poison topic's table
    /// cannot be created, or the name isn't a valid table-name component.
    pub async fn with_poison_topic(mut self, topic: impl Into<String>) -> Result<Self, QueueError> {
        self.poison_topic = topic.into();
        self.ensure_table(&self.poison_topic).await?;
        Ok(self)
    }

    /// The `queue_<topic>` table name backing a given topic.
    ///
    /// # Errors
    ///
    /// [`QueueError::SubscribeFailed`] if `topic` contains anything other
    /// than ASCII alphanumerics and underscores (it's spliced directly into
    /// SQL, since table names can't be bind parameters).
    fn table_name(topic: &str) -> Result<String, QueueError> {
        if topic.is_empty()
            || !topic.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(QueueError::SubscribeFailed(format!(
                "invalid topic name for a table identifier: {topic:?}"
            )));
        }
        Ok(format!("queue_{topic}"))
    }

    async fn ensure_table(&self, topic: &str) -> Result<(), QueueError> {
        let table = Self::table_name(topic)?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                message_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                context JSONB NOT NULL,
                attempts INT NOT NULL DEFAULT 0,
                available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                reserved_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_claimable
                ON {table} (available_at)
                WHERE reserved_at IS NULL;
            "#
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        Ok(())
    }

    async fn claim_next(&self, topic: &str) -> Result<Option<ClaimedMessage>, QueueError> {
        let table = Self::table_name(topic)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;

        let select = format!(
            r"UPDATE {table}
               SET reserved_at = now()
               WHERE id = (
                   SELECT id FROM {table}
                   WHERE reserved_at IS NULL AND available_at <= now()
                   ORDER BY id ASC
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id, message_type, payload, context, attempts"
        );
        let row = sqlx::query(&select)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row
            .try_get("id")
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        let message_type: String = row
            .try_get("message_type")
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        let payload: Vec<u8> = row
            .try_get("payload")
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        let context: serde_json::Value = row
            .try_get("context")
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        let attempts: i32 = row
            .try_get("attempts")
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;

        let context: QueueContext = serde_json::from_value(context)
            .map_err(|e| QueueError::DecodeFailed(e.to_string()))?;

        Ok(Some(ClaimedMessage {
            id,
            attempts: usize::try_from(attempts).unwrap_or(usize::MAX),
            message: QueueMessage::new(message_type, payload, context),
        }))
    }

    async fn ack(&self, topic: &str, id: i64) -> Result<(), QueueError> {
        let table = Self::table_name(topic)?;
        let delete = format!(r"DELETE FROM {table} WHERE id = $1");
        sqlx::query(&delete)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        Ok(())
    }

    /// Release a failed message back for redelivery after a backoff delay,
    /// or move it to the poison topic if its retries are exhausted.
    async fn nack(&self, claimed: ClaimedMessage, reason: &str) -> Result<(), QueueError> {
        let next_attempt = claimed.attempts + 1;
        if next_attempt > self.retry_policy.max_retries {
            self.route_to_poison(&claimed.message, reason).await?;
            self.ack(&self.topic, claimed.id).await?;
            return Ok(());
        }

        let delay = self.retry_policy.delay_for_attempt(next_attempt);
        let table = Self::table_name(&self.topic)?;
        let update = format!(
            r"UPDATE {table}
               SET reserved_at = NULL, attempts = $2, available_at = now() + $3::INTERVAL
               WHERE id = $1"
        );
        sqlx::query(&update)
            .bind(claimed.id)
            .bind(i32::try_from(next_attempt).unwrap_or(i32::MAX))
            .bind(format!("{} seconds", delay.as_secs_f64()))
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        Ok(())
    }

    async fn route_to_poison(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let mut context = message.context.clone();
        context
            .extra
            .insert(FAILURE_REASON_KEY.to_string(), reason.to_string());
        let context = serde_json::to_value(&context)
            .map_err(|e| QueueError::EncodeFailed(e.to_string()))?;

        let table = Self::table_name(&self.poison_topic)?;
        let insert = format!(
            r"INSERT INTO {table} (message_type, payload, context) VALUES ($1, $2, $3)"
        );
        sqlx::query(&insert)
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(context)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::PublishFailed(e.to_string()))?;
        Ok(())
    }

    /// List messages currently sitting in the poison topic, oldest first.
    ///
    /// Operational read path for inspecting `failures` without a side
    /// table — the poisoned rows live in the same `queue_<topic>` schema as
    /// any other queue.
    ///
    /// # Errors
    ///
    /// [`QueueError::SubscribeFailed`] if the query fails.
    pub async fn list_failed(&self, limit: i64) -> Result<Vec<FailedMessage>, QueueError> {
        let table = Self::table_name(&self.poison_topic)?;
        let select = format!(
            r"SELECT id, message_type, payload, context, attempts, created_at
               FROM {table} ORDER BY id ASC LIMIT $1"
        );
        let rows = sqlx::query(&select)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        rows.into_iter().map(row_to_failed_message).collect()
    }

    /// Count how many messages are currently sitting in the poison topic.
    ///
    /// # Errors
    ///
    /// [`QueueError::SubscribeFailed`] if the query fails.
    pub async fn count_failed(&self) -> Result<i64, QueueError> {
        let table = Self::table_name(&self.poison_topic)?;
        let select = format!(r"SELECT COUNT(*) AS count FROM {table}");
        let row = sqlx::query(&select)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
        row.try_get("count")
            .map_err(|e| QueueError::SubscribeFailed(e.to_string()))
    }
}

struct ClaimedMessage {
    id: i64,
    attempts: usize,
    message: QueueMessage,
}

/// A message sitting in a poison topic, with its recorded failure reason
/// (if the retry middleware attached one) surfaced for operator tooling.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub id: i64,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub context: QueueContext,
    pub attempts: usize,
    pub failed_at: DateTime<Utc>,
}

impl FailedMessage {
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.context.extra.get(FAILURE_REASON_KEY).map(String::as_str)
    }
}

fn row_to_failed_message(row: sqlx::postgres::PgRow) -> Result<FailedMessage, QueueError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
    let message_type: String = row
        .try_get("message_type")
        .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
    let payload: Vec<u8> = row
        .try_get("payload")
        .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
    let context: serde_json::Value = row
        .try_get("context")
        .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
    let attempts: i32 = row
        .try_get("attempts")
        .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;
    let failed_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| QueueError::SubscribeFailed(e.to_string()))?;

    let context: QueueContext = serde_json::from_value(context)
        .map_err(|e| QueueError::DecodeFailed(e.to_string()))?;

    Ok(FailedMessage {
        id,
        message_type,
        payload,
        context,
        attempts: usize::try_from(attempts).unwrap_or(usize::MAX),
        failed_at,
    })
}

impl Queue for PostgresQueue {
    fn publish(
        &self,
        messages: Vec<QueueMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move {
            let table = Self::table_name(&self.topic)?;
            let insert = format!(
                r"INSERT INTO {table} (message_type, payload, context) VALUES ($1, $2, $3)"
            );
            for message in messages {
                let context = serde_json::to_value(&message.context)
                    .map_err(|e| QueueError::EncodeFailed(e.to_string()))?;
                sqlx::query(&insert)
                    .bind(&message.message_type)
                    .bind(&message.payload)
                    .bind(context)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| QueueError::PublishFailed(e.to_string()))?;
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
        handler: QueueHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move {
            loop {
                let Some(claimed) = self.claim_next(&self.topic).await? else {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                };

                let id = claimed.id;
                match handler(claimed.message.clone()).await {
                    Ok(()) => self.ack(&self.topic, id).await?,
                    Err(error) => self.nack(claimed, &error.to_string()).await?,
                }
            }
        })
    }

    fn poison_topic(&self) -> &str {
        &self.poison_topic
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.pool.close().await;
        })
    }
}
