//! Handler traits a module registers against the bus, and the opaque
//! lookup abstraction (`HandlerRegistry`) the bus resolves route names
//! through.
//!
//! DI-container wiring itself (how a concrete `HandlerRegistry` is built
//! from constructors, config, and shared services) is out of scope here;
//! this crate only defines the seam a concrete container plugs into.

use crate::context::DispatchContext;
use crate::error::FrameworkError;
use crate::event::SerializedEvent;
use crate::message::Dispatchable;
use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

/// The outcome of executing a command synchronously.
#[derive(Clone, Debug, Default)]
pub struct CommandResponse {
    /// An opaque identifier the handler chooses to hand back to the caller
    /// (e.g. the id of a newly created aggregate). Absent for commands that
    /// have nothing meaningful to return.
    pub id: Option<String>,
}

impl CommandResponse {
    #[must_use]
    pub const fn new(id: Option<String>) -> Self {
        Self { id }
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self { id: None }
    }
}

/// Executes exactly one command type.
///
/// Implementations downcast `command` via [`Any::downcast_ref`] to their
/// own concrete [`crate::message::Command`] type; the bus only ever invokes
/// a handler through the route it was registered on, so the downcast is
/// infallible in practice, but a malformed registration (handler wired to
/// the wrong command name) would surface as a downcast failure rather than
/// a panic.
pub trait CommandHandler: Send + Sync {
    fn execute(
        &self,
        ctx: DispatchContext,
        command: &dyn Any,
    ) -> BoxFuture<'_, Result<(CommandResponse, Vec<Dispatchable>), FrameworkError>>;
}

/// Executes exactly one query type, filling in the caller-supplied result.
pub trait QueryHandler: Send + Sync {
    fn execute(
        &self,
        ctx: DispatchContext,
        query: &dyn Any,
        result: &mut dyn Any,
    ) -> BoxFuture<'_, Result<(), FrameworkError>>;
}

/// Reacts to one published event. An event may have zero or more
/// `EventHandler`s fanned out to it by the router.
pub trait EventHandler: Send + Sync {
    fn handle(&self, ctx: DispatchContext, event: &SerializedEvent) -> BoxFuture<'_, Result<Vec<Dispatchable>, FrameworkError>>;

    /// Whether this handler should run through the durable queue
    /// (at-least-once, out of line) rather than inline during `publish`.
    /// Defaults to `true`: async is the safer default for a handler with
    /// unknown side effects.
    fn is_async(&self) -> bool {
        true
    }
}

/// The handler-lookup seam between the router's route names and actual
/// handler implementations — the Rust stand-in for the reference
/// implementation's DI container.
///
/// A concrete registry is typically just handler instances collected into
/// three name-keyed maps at startup, built once and shared behind an `Arc`.
pub trait HandlerRegistry: Send + Sync {
    fn command_handler(&self, name: &str) -> Option<Arc<dyn CommandHandler>>;
    fn query_handler(&self, name: &str) -> Option<Arc<dyn QueryHandler>>;
    fn event_handler(&self, name: &str) -> Option<Arc<dyn EventHandler>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_response_empty_has_no_id() {
        assert!(CommandResponse::empty().id.is_none());
    }

    #[test]
    fn command_response_new_carries_id() {
        let response = CommandResponse::new(Some("order-1".to_string()));
        assert_eq!(response.id.as_deref(), Some("order-1"));
    }
}
