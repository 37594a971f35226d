//! # cqrs-core
//!
//! Core traits and types for a CQRS/event-sourcing message bus: the
//! command/query/event tagged union, the event store and durable queue
//! abstractions handlers are built against, scope-based authorization, and
//! the request-scoped context threaded through dispatch.
//!
//! Concrete backends (`cqrs-postgres`), the router (`cqrs-router`), the bus
//! orchestration layer (`cqrs-bus`), and the background job controller
//! (`cqrs-jobs`) all build on the traits defined here, so that application
//! code depends only on `cqrs-core` and swaps backends without touching
//! handler code.

pub mod context;
pub mod credentials;
pub mod error;
pub mod event;
pub mod event_store;
pub mod handler;
pub mod message;
pub mod queue;
pub mod registry;
pub mod stream;

pub use context::{DispatchContext, QueueContext};
pub use credentials::{Credentials, Forbidden};
pub use error::FrameworkError;
pub use event::{Event, EventError, SerializedEvent, StoredEvent};
pub use event_store::{EventStore, EventStoreError, ExpectedVersion, Select};
pub use handler::{CommandHandler, CommandResponse, EventHandler, HandlerRegistry, QueryHandler};
pub use message::{Command, Dispatchable, Query, QueuedEvent};
pub use queue::{Queue, QueueError, QueueMessage};
pub use registry::{MessageRegistry, RegistryError};
pub use stream::{AggregateType, OwnerId, StreamId, Version};

/// A source of the current time, injected rather than called globally so
/// tests can supply a fixed clock.
///
/// Used by the background job controller to decide whether a job is due and
/// by handlers that stamp events with a creation time.
pub trait Clock: Send + Sync {
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}

/// The system clock: [`Clock::now`] simply returns `Utc::now()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_returns_a_recent_time() {
        let before = chrono::Utc::now();
        let now = SystemClock.now();
        assert!(now >= before);
    }
}
