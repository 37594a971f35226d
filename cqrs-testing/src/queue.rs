//! In-memory [`Queue`] fake.
//!
//! A single `Mutex`-guarded `VecDeque` stands in for the durable queue table
//! `PostgresQueue` backs onto; a failed handler routes its message straight
//! to an in-memory poison list rather than `PostgresQueue`'s
//! backoff-then-redeliver schedule, since a test fake has no process restart
//! to survive across.

use cqrs_core::queue::{Queue, QueueError, QueueHandler, QueueMessage};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Metadata key a failed message is stamped with before it's routed to the
/// poison topic, mirroring `cqrs-postgres`'s `PostgresQueue`.
const FAILURE_REASON_KEY: &str = "x-failure-reason";

struct Inner {
    messages: VecDeque<QueueMessage>,
    poison: Vec<QueueMessage>,
    closed: bool,
}

/// A [`Queue`] backed by an in-process `VecDeque`, for tests.
///
/// Cheaply cloneable — every clone shares the same underlying queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    poison_topic: String,
}

impl InMemoryQueue {
    /// An empty queue with the default `"failures"` poison topic.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                messages: VecDeque::new(),
                poison: Vec::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            poison_topic: "failures".to_string(),
        }
    }

    /// Override the poison topic name reported by [`Queue::poison_topic`].
    #[must_use]
    pub fn with_poison_topic(mut self, topic: impl Into<String>) -> Self {
        self.poison_topic = topic.into();
        self
    }

    /// Messages that exhausted a handler without acknowledgement, oldest
    /// first. Test-only inspection hook; not part of the `Queue` trait.
    pub async fn poisoned(&self) -> Vec<QueueMessage> {
        self.inner.lock().await.poison.clone()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for InMemoryQueue {
    fn publish(
        &self,
        messages: Vec<QueueMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        let notify = Arc::clone(&self.notify);
        Box::pin(async move {
            let mut guard = inner.lock().await;
            guard.messages.extend(messages);
            drop(guard);
            notify.notify_waiters();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        handler: QueueHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        let notify = Arc::clone(&self.notify);
        Box::pin(async move {
            loop {
                let notified = notify.notified();
                let next = {
                    let mut guard = inner.lock().await;
                    guard.messages.pop_front()
                };

                let Some(message) = next else {
                    if inner.lock().await.closed {
                        return Ok(());
                    }
                    notified.await;
                    continue;
                };

                if let Err(error) = handler(message.clone()).await {
                    let mut context = message.context.clone();
                    context
                        .extra
                        .insert(FAILURE_REASON_KEY.to_string(), error.to_string());
                    inner.lock().await.poison.push(QueueMessage::new(
                        message.message_type,
                        message.payload,
                        context,
                    ));
                }
            }
        })
    }

    fn poison_topic(&self) -> &str {
        &self.poison_topic
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        let notify = Arc::clone(&self.notify);
        Box::pin(async move {
            inner.lock().await.closed = true;
            notify.notify_waiters();
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cqrs_core::context::QueueContext;
    use cqrs_core::credentials::Credentials;
    use std::collections::HashMap;

    fn message(message_type: &str) -> QueueMessage {
        QueueMessage::new(
            message_type.to_string(),
            vec![1, 2, 3],
            QueueContext {
                correlation_id: uuid::Uuid::new_v4(),
                job_id: None,
                credentials: Credentials::blank(),
                extra: HashMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_in_order() {
        let queue = InMemoryQueue::new();
        queue
            .publish(vec![message("PlaceOrder"), message("ShipOrder")])
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscriber = queue.clone();
        let handle = tokio::spawn(async move {
            subscriber
                .subscribe(Box::new(move |msg| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(msg.message_type);
                        Ok(())
                    })
                }))
                .await
        });

        assert_eq!(rx.recv().await.unwrap(), "PlaceOrder");
        assert_eq!(rx.recv().await.unwrap(), "ShipOrder");

        queue.close().await;
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("subscribe loop should stop after close")
            .expect("subscribe task should not panic")
            .expect("subscribe loop should return Ok");
    }

    #[tokio::test]
    async fn a_failed_handler_routes_the_message_to_poison() {
        let queue = InMemoryQueue::new();
        queue.publish(vec![message("PlaceOrder")]).await.unwrap();

        let subscriber = queue.clone();
        let handle = tokio::spawn(async move {
            subscriber
                .subscribe(Box::new(|_msg| {
                    Box::pin(async { Err(QueueError::PublishFailed("boom".to_string())) })
                }))
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        queue.close().await;
        handle.await.unwrap().unwrap();

        let poisoned = queue.poisoned().await;
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].message_type, "PlaceOrder");
        assert_eq!(
            poisoned[0].context.extra.get(FAILURE_REASON_KEY).map(String::as_str),
            Some("publish failed: boom")
        );
    }

    #[tokio::test]
    async fn default_poison_topic_is_failures() {
        assert_eq!(InMemoryQueue::new().poison_topic(), "failures");
    }

    #[tokio::test]
    async fn with_poison_topic_overrides_the_default() {
        let queue = InMemoryQueue::new().with_poison_topic("dead-letters");
        assert_eq!(queue.poison_topic(), "dead-letters");
    }
}
