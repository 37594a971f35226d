//! Event store trait and related types for event sourcing.
//!
//! This module defines the core abstraction for an event store — a specialized
//! store optimized for appending events to streams under optimistic
//! concurrency control, replaying a stream's history, and subscribing to the
//! full event log as a competing-consumer feed for fan-out into the bus.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `cqrs-postgres`): production implementation
//! - `InMemoryEventStore` (in `cqrs-testing`): fast, deterministic testing

use crate::event::StoredEvent;
use crate::stream::{StreamId, Version};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Type alias for snapshot data: `(Version, Vec<u8>)`
type SnapshotData = (Version, Vec<u8>);

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: expected version doesn't match current version.
    #[error("concurrency conflict on {stream}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The stream where the conflict occurred.
        stream: StreamId,
        /// The version the caller expected the stream to be at.
        expected: Version,
        /// The stream's actual current version.
        actual: Version,
    },

    /// A batch of events appended in one call had non-contiguous versions, or
    /// did not start immediately after the stream's current version.
    #[error("events are not contiguous with stream {stream} at version {at}")]
    InconsistentEvents {
        /// The stream the append targeted.
        stream: StreamId,
        /// The version the inconsistency was detected at.
        at: Version,
    },

    /// Stream not found in the event store.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Database connection or query error.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Optional filter applied to a historical replay via [`EventStore::stream`].
#[derive(Clone, Debug, Default)]
pub struct Select {
    /// Restrict to a single aggregate type.
    pub aggregate_type: Option<String>,
    /// Restrict to a single owner id.
    pub owner_id: Option<String>,
    /// Only events at or after this version.
    pub from_version: Option<Version>,
}

impl Select {
    /// Select everything (the whole event log, from the beginning).
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Select a single stream's full history.
    #[must_use]
    pub fn stream(stream: &StreamId) -> Self {
        Self {
            aggregate_type: Some(stream.aggregate_type().as_str().to_string()),
            owner_id: Some(stream.owner_id().as_str().to_string()),
            from_version: None,
        }
    }

    #[must_use]
    pub fn from(mut self, version: Version) -> Self {
        self.from_version = Some(version);
        self
    }
}

/// What an [`EventStore::append_events`] caller expects the stream's current
/// version to be.
///
/// `Any` skips the concurrency check entirely (the caller already knows its
/// own events are new — e.g. publishing events from an aggregate whose
/// command handler already enforced concurrency at its own layer) while
/// still enforcing that the appended batch is version-contiguous with
/// whatever the stream's current version turns out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The stream must currently be at exactly this version.
    Exact(Version),
    /// Skip the concurrency check; append after whatever the current version is.
    Any,
}

impl From<Version> for ExpectedVersion {
    fn from(version: Version) -> Self {
        Self::Exact(version)
    }
}

/// Callback invoked for each event delivered by [`EventStore::subscribe`].
///
/// Returning `Err` aborts the subscribe loop's current transaction without
/// acknowledging the event, leaving it to be picked up again.
pub type SubscribeCallback = Box<
    dyn Fn(StoredEvent) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send>>
        + Send
        + Sync,
>;

/// Event store abstraction: an append-only log of events grouped into
/// streams, with competing-consumer delivery of the full log.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` so it can be used behind `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Append events to a stream with optimistic concurrency control.
    ///
    /// `expected_version` must equal the stream's current version (or be
    /// [`ExpectedVersion::Any`] to skip that check) or the append is
    /// rejected with [`EventStoreError::ConcurrencyConflict`]. Appended
    /// events must carry contiguous versions starting immediately after the
    /// stream's current version.
    ///
    /// Returns the stream's new version (the version of the last event
    /// appended).
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::ConcurrencyConflict`] — the stream moved since the
    ///   caller last read it.
    /// - [`EventStoreError::InconsistentEvents`] — the batch's versions were
    ///   not contiguous with the stream's current version.
    /// - [`EventStoreError::DatabaseError`] / [`EventStoreError::SerializationError`]
    fn append_events(
        &self,
        stream: StreamId,
        expected_version: ExpectedVersion,
        events: Vec<StoredEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>>;

    /// Historical replay: load events matching `select`, ordered by version
    /// ascending. Used to reconstruct aggregate state.
    ///
    /// Returns an empty vector if no events match — this is not an error,
    /// since new streams start empty.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::DatabaseError`] / [`EventStoreError::SerializationError`]
    fn stream(
        &self,
        select: Select,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>>;

    /// Live competing-consumer subscription over the entire event log.
    ///
    /// Runs until the event store is closed or `callback` returns an error.
    /// Multiple processes may call `subscribe` concurrently against the same
    /// store; each event is claimed by exactly one caller at a time via
    /// row-level locking, with abandoned claims recovered after a lease
    /// timeout so an event is never permanently stuck.
    ///
    /// # Errors
    ///
    /// Returns whatever error `callback` produced, or a database error if the
    /// subscribe loop itself fails.
    fn subscribe(
        &self,
        callback: SubscribeCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Save a snapshot of aggregate state at a given version.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::DatabaseError`]
    fn save_snapshot(
        &self,
        stream: StreamId,
        version: Version,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Load the latest snapshot for a stream, if any.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::DatabaseError`] / [`EventStoreError::SerializationError`]
    fn load_snapshot(
        &self,
        stream: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SnapshotData>, EventStoreError>> + Send + '_>>;
}

/// Check that `expected` matches a stream's `actual` current version.
///
/// [`ExpectedVersion::Any`] always passes. Factored out of the append path
/// so it can be unit tested without a database, and reused identically by
/// every `EventStore` implementation.
///
/// # Errors
///
/// [`EventStoreError::ConcurrencyConflict`] if the versions differ.
pub fn check_expected_version(
    stream: &StreamId,
    expected: ExpectedVersion,
    actual: Version,
) -> Result<(), EventStoreError> {
    let ExpectedVersion::Exact(expected) = expected else {
        return Ok(());
    };
    if expected != actual {
        return Err(EventStoreError::ConcurrencyConflict {
            stream: stream.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Check that a batch of events to append has contiguous versions starting
/// immediately after `current`.
///
/// # Errors
///
/// [`EventStoreError::InconsistentEvents`] if a gap or an out-of-order
/// version is found.
pub fn check_events_consistent(
    stream: &StreamId,
    current: Version,
    events: &[StoredEvent],
) -> Result<(), EventStoreError> {
    let mut expected = current.next();
    for event in events {
        if event.version != expected {
            return Err(EventStoreError::InconsistentEvents {
                stream: stream.clone(),
                at: expected,
            });
        }
        expected = expected.next();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SerializedEvent;
    use chrono::Utc;

    fn fixture(stream: &StreamId, version: Version) -> StoredEvent {
        StoredEvent::new(
            stream.clone(),
            version,
            Utc::now(),
            SerializedEvent::new("Test.v1".to_string(), vec![1, 2, 3], None),
        )
    }

    #[test]
    fn concurrency_conflict_error_display() {
        let stream = StreamId::new("order", "order-1");
        let error = EventStoreError::ConcurrencyConflict {
            stream: stream.clone(),
            expected: Version::new(5),
            actual: Version::new(7),
        };

        let display = format!("{error}");
        assert!(display.contains("expected version 5"));
        assert!(display.contains("found 7"));
    }

    #[test]
    fn check_expected_version_accepts_match() {
        let stream = StreamId::new("order", "order-1");
        assert!(check_expected_version(&stream, ExpectedVersion::Exact(Version::new(3)), Version::new(3)).is_ok());
    }

    #[test]
    fn check_expected_version_rejects_mismatch() {
        let stream = StreamId::new("order", "order-1");
        let result = check_expected_version(&stream, ExpectedVersion::Exact(Version::new(3)), Version::new(5));
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[test]
    fn check_expected_version_any_always_passes() {
        let stream = StreamId::new("order", "order-1");
        assert!(check_expected_version(&stream, ExpectedVersion::Any, Version::new(99)).is_ok());
    }

    #[test]
    fn check_events_consistent_accepts_contiguous_batch() {
        let stream = StreamId::new("order", "order-1");
        let events = vec![
            fixture(&stream, Version::new(4)),
            fixture(&stream, Version::new(5)),
            fixture(&stream, Version::new(6)),
        ];
        assert!(check_events_consistent(&stream, Version::new(3), &events).is_ok());
    }

    #[test]
    fn check_events_consistent_rejects_gap() {
        let stream = StreamId::new("order", "order-1");
        let events = vec![
            fixture(&stream, Version::new(4)),
            fixture(&stream, Version::new(6)),
        ];
        let result = check_events_consistent(&stream, Version::new(3), &events);
        assert!(matches!(
            result,
            Err(EventStoreError::InconsistentEvents { .. })
        ));
    }

    #[test]
    fn check_events_consistent_rejects_wrong_start() {
        let stream = StreamId::new("order", "order-1");
        let events = vec![fixture(&stream, Version::new(9))];
        let result = check_events_consistent(&stream, Version::new(3), &events);
        assert!(matches!(
            result,
            Err(EventStoreError::InconsistentEvents { .. })
        ));
    }
}
