//! Durable message queue abstraction.
//!
//! A [`Queue`] carries commands and queued events from the point they're
//! dispatched asynchronously to the point a worker picks them back up,
//! surviving a process restart in between. It is deliberately a single
//! logical topic, not a general pub/sub broker: everything published to a
//! queue is delivered, in some order, to whatever is subscribed to that same
//! queue. A poison topic (see [`Queue::poison_topic`]) is realized as just
//! another instance of the same mechanism under a different name, the way
//! the reference implementation's `middleware.PoisonQueue` wraps the same
//! SQL-backed queue rather than standing up a separate store.

use crate::context::QueueContext;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Failed to publish one or more messages.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The subscribe loop itself failed (not an individual handler error).
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Failed to encode a message for the wire.
    #[error("encode failed: {0}")]
    EncodeFailed(String),

    /// Failed to decode a message off the wire.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// A single queued message: its registered type name, its encoded payload,
/// and the dispatch context it was published with.
#[derive(Clone, Debug)]
pub struct QueueMessage {
    /// The name the payload was registered under in the [`crate::registry::MessageRegistry`].
    pub message_type: String,
    /// Opaque, length-prefix-free encoded payload (bincode).
    pub payload: Vec<u8>,
    /// The context the message was published with.
    pub context: QueueContext,
}

impl QueueMessage {
    #[must_use]
    pub const fn new(message_type: String, payload: Vec<u8>, context: QueueContext) -> Self {
        Self {
            message_type,
            payload,
            context,
        }
    }
}

/// Callback invoked for each message delivered by [`Queue::subscribe`].
///
/// Returning `Err` nacks the message; the queue's retry policy decides
/// whether it's redelivered or routed to the poison topic.
pub type QueueHandler = Box<
    dyn Fn(QueueMessage) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>
        + Send
        + Sync,
>;

/// A durable, single-topic message queue.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` so it
/// can be used behind `Arc<dyn Queue>`.
pub trait Queue: Send + Sync {
    /// Publish messages to this queue's topic.
    ///
    /// # Errors
    ///
    /// [`QueueError::PublishFailed`] / [`QueueError::EncodeFailed`]
    fn publish(
        &self,
        messages: Vec<QueueMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Run the subscribe loop, delivering messages to `handler` until the
    /// queue is closed.
    ///
    /// Failed messages are retried with exponential backoff up to a fixed
    /// retry limit, then routed to the poison topic; they are never dropped
    /// silently.
    ///
    /// # Errors
    ///
    /// [`QueueError::SubscribeFailed`] if the subscribe loop itself fails
    /// (e.g. the backing connection is lost).
    fn subscribe(
        &self,
        handler: QueueHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// The name of this queue's poison topic, where messages that exhausted
    /// their retries are moved instead of being dropped.
    fn poison_topic(&self) -> &str {
        "failures"
    }

    /// Release any held resources (connections, background tasks).
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn queue_message_carries_type_and_payload() {
        let ctx = QueueContext {
            correlation_id: Uuid::new_v4(),
            job_id: None,
            credentials: Credentials::blank(),
            extra: HashMap::new(),
        };
        let message = QueueMessage::new("PlaceOrder".to_string(), vec![1, 2, 3], ctx);
        assert_eq!(message.message_type, "PlaceOrder");
        assert_eq!(message.payload, vec![1, 2, 3]);
    }

    #[test]
    fn default_poison_topic_is_failures() {
        struct Stub;
        impl Queue for Stub {
            fn publish(
                &self,
                _messages: Vec<QueueMessage>,
            ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
                Box::pin(async { Ok(()) })
            }
            fn subscribe(
                &self,
                _handler: QueueHandler,
            ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
                Box::pin(async { Ok(()) })
            }
            fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
                Box::pin(async {})
            }
        }

        assert_eq!(Stub.poison_topic(), "failures");
    }
}
