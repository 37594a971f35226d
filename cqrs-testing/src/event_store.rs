//! In-memory [`EventStore`] fake.
//!
//! Keeps every stream's full history in a single `Mutex`-guarded `Vec`, the
//! way [`crate::queue::InMemoryQueue`] keeps a single `VecDeque` — no SQL, no
//! advisory locks, so bus/router/controller tests run without a database.
//! `subscribe` is single-consumer rather than `PostgresEventStore`'s
//! competing-consumer claim/ack: each call replays the log from its own
//! cursor and then tails new appends, woken by a shared [`tokio::sync::Notify`]
//! instead of polling.

use cqrs_core::event_store::{
    check_events_consistent, check_expected_version, EventStore, EventStoreError, ExpectedVersion,
    Select, SubscribeCallback,
};
use cqrs_core::event::StoredEvent;
use cqrs_core::stream::{StreamId, Version};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

struct Inner {
    events: Vec<StoredEvent>,
    snapshots: std::collections::HashMap<StreamId, (Version, Vec<u8>)>,
    closed: bool,
}

impl Inner {
    fn current_version(&self, stream: &StreamId) -> Version {
        self.events
            .iter()
            .filter(|event| &event.stream == stream)
            .map(|event| event.version)
            .max()
            .unwrap_or(Version::INITIAL)
    }
}

/// An [`EventStore`] backed by an in-process `Vec`, for tests.
///
/// Cheaply cloneable — every clone shares the same underlying log.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryEventStore {
    /// An empty event store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                events: Vec::new(),
                snapshots: std::collections::HashMap::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Stop every in-flight [`EventStore::subscribe`] loop once it has
    /// drained whatever is currently in the log.
    ///
    /// `EventStore` itself has no `close` method (unlike [`cqrs_core::Queue`]),
    /// since `PostgresEventStore`'s subscribe loop runs forever and relies on
    /// its caller aborting the task; this fake offers a graceful alternative
    /// so tests don't have to reach for `JoinHandle::abort`.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Snapshot of every event currently appended, in insertion order.
    ///
    /// Test-only inspection hook; not part of the `EventStore` trait.
    pub async fn all_events(&self) -> Vec<StoredEvent> {
        self.inner.lock().await.events.clone()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn append_events(
        &self,
        stream: StreamId,
        expected_version: ExpectedVersion,
        events: Vec<StoredEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        let notify = Arc::clone(&self.notify);
        Box::pin(async move {
            if events.is_empty() {
                return Err(EventStoreError::DatabaseError(
                    "cannot append an empty batch of events".to_string(),
                ));
            }
            if events.iter().any(|event| event.stream != stream) {
                return Err(EventStoreError::InconsistentEvents {
                    stream: stream.clone(),
                    at: events[0].version,
                });
            }

            let mut guard = inner.lock().await;
            let current = guard.current_version(&stream);
            check_expected_version(&stream, expected_version, current)?;
            check_events_consistent(&stream, current, &events)?;

            let new_version = events.last().map_or(current, |last| last.version);
            guard.events.extend(events);
            drop(guard);
            notify.notify_waiters();
            Ok(new_version)
        })
    }

    fn stream(
        &self,
        select: Select,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let guard = inner.lock().await;
            let mut matched: Vec<StoredEvent> = guard
                .events
                .iter()
                .filter(|event| {
                    select
                        .aggregate_type
                        .as_deref()
                        .is_none_or(|t| event.stream.aggregate_type().as_str() == t)
                        && select
                            .owner_id
                            .as_deref()
                            .is_none_or(|o| event.stream.owner_id().as_str() == o)
                        && select.from_version.is_none_or(|v| event.version >= v)
                })
                .cloned()
                .collect();
            matched.sort_by(|a, b| {
                (a.stream.aggregate_type().as_str(), a.stream.owner_id().as_str(), a.version).cmp(&(
                    b.stream.aggregate_type().as_str(),
                    b.stream.owner_id().as_str(),
                    b.version,
                ))
            });
            Ok(matched)
        })
    }

    fn subscribe(
        &self,
        callback: SubscribeCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        let notify = Arc::clone(&self.notify);
        Box::pin(async move {
            let mut position = 0usize;
            loop {
                let notified = notify.notified();
                let (batch, closed) = {
                    let guard = inner.lock().await;
                    (guard.events[position..].to_vec(), guard.closed)
                };

                if batch.is_empty() {
                    if closed {
                        return Ok(());
                    }
                    notified.await;
                    continue;
                }

                for event in batch {
                    position += 1;
                    callback(event).await?;
                }
            }
        })
    }

    fn save_snapshot(
        &self,
        stream: StreamId,
        version: Version,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.lock().await.snapshots.insert(stream, (version, state));
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        stream: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(Version, Vec<u8>)>, EventStoreError>> + Send + '_>>
    {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { Ok(inner.lock().await.snapshots.get(&stream).cloned()) })
    }
}

#[cfg(test)]
fn fixture(stream: &StreamId, version: Version, at: chrono::DateTime<chrono::Utc>) -> StoredEvent {
    StoredEvent::new(
        stream.clone(),
        version,
        at,
        cqrs_core::event::SerializedEvent::new("Test.v1".to_string(), vec![1, 2, 3], None),
    )
}
