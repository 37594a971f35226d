//! The command/query/event/queued-event tagged union the router and bus
//! dispatch on, plus the marker traits a handler's input type implements.
//!
//! Every message travelling through the bus is one of four kinds:
//!
//! - [`Command`] — an imperative instruction, routed to exactly one handler.
//! - [`Query`] — a read request, routed to exactly one handler, producing a result.
//! - an event (see [`crate::event::Event`]) — a fact, fanned out to zero or more handlers.
//! - [`QueuedEvent`] — an event paired with the one handler name it was queued
//!   for; this is what actually crosses the durable queue, since fan-out has
//!   already been resolved by the time an event reaches the queue.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// A command: an instruction to change state, handled by exactly one handler.
///
/// Mirrors the reference implementation's `Command` interface: a message with
/// a stable name used to look up its single registered handler.
pub trait Command: Send + Sync + 'static {
    /// Stable command name used for handler lookup and logging, e.g. `"PlaceOrder"`.
    fn command_name(&self) -> &'static str;

    /// Structural validation independent of any scope check; run by the
    /// bus's validation guard before the command reaches its handler.
    ///
    /// # Errors
    ///
    /// A descriptive message if the command's fields are invalid.
    fn valid(&self) -> Result<(), String> {
        Ok(())
    }

    /// The scope groups a caller must satisfy to execute this command (see
    /// [`crate::credentials::enforce`]). May inspect the command's own
    /// fields to build dynamic, data-dependent requirements (e.g. requiring
    /// `user:<owner_id>` for a command that only the resource's owner may
    /// issue). The default is public: no scopes required.
    fn auth(&self) -> Vec<Vec<&'static str>> {
        Vec::new()
    }

    /// Type-erased view of this command, for downcasting after routing.
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// A query: a read request, handled by exactly one handler, producing a result.
pub trait Query: Send + Sync + 'static {
    /// Stable query name used for handler lookup and logging, e.g. `"GetOrder"`.
    fn query_name(&self) -> &'static str;

    /// Structural validation independent of any scope check.
    ///
    /// # Errors
    ///
    /// A descriptive message if the query's fields are invalid.
    fn valid(&self) -> Result<(), String> {
        Ok(())
    }

    /// The scope groups a caller must satisfy to execute this query. See
    /// [`Command::auth`]; the default is public.
    fn auth(&self) -> Vec<Vec<&'static str>> {
        Vec::new()
    }

    /// Type-erased view of this query, for downcasting after routing.
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// An event paired with the single handler name it was queued against.
///
/// Fan-out (deciding which handlers care about an event) happens once, when
/// the event is first published; each `(event, handler)` pair is then routed
/// and, if async, queued independently so one slow or failing handler can't
/// block or poison delivery to the others.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// The event being delivered.
    pub event: crate::event::SerializedEvent,
    /// The name of the single handler this delivery is destined for.
    pub handler: String,
}

impl QueuedEvent {
    /// The message type name `QueuedEvent` envelopes register under.
    pub const MESSAGE_TYPE: &'static str = "QueuedEvent";

    #[must_use]
    pub const fn new(event: crate::event::SerializedEvent, handler: String) -> Self {
        Self { event, handler }
    }
}

impl fmt::Display for QueuedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueuedEvent({} -> {})", self.event.event_type, self.handler)
    }
}

/// The tagged union the router and bus dispatch loop operate over.
///
/// Commands and queries are boxed trait objects rather than `Box<dyn Any>`:
/// both `Command` and `Query` are dyn-compatible, so the bus can call
/// `command_name()`/`valid()`/`auth()` directly on the routed value without
/// first recovering its concrete type, and only needs `as_any()` once it
/// actually reaches the registered handler for that exact type. Events
/// travel as [`crate::event::SerializedEvent`] since, once they leave the
/// aggregate that raised them, nothing downstream needs the concrete Rust
/// type — only the registry does, to decode them back for a handler.
pub enum Dispatchable {
    /// A routable command.
    Command(Box<dyn Command>),
    /// A routable query.
    Query(Box<dyn Query>),
    /// An event fanned out to zero or more handlers.
    Event(crate::event::SerializedEvent),
    /// An event already bound to the one handler it's queued for.
    QueuedEvent(QueuedEvent),
}

impl Dispatchable {
    /// Wrap a concrete command for routing.
    pub fn command<C: Command>(cmd: C) -> Self {
        Self::Command(Box::new(cmd))
    }

    /// Wrap a concrete query for routing.
    pub fn query<Q: Query>(query: Q) -> Self {
        Self::Query(Box::new(query))
    }
}

impl fmt::Debug for Dispatchable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(cmd) => write!(f, "Dispatchable::Command({})", cmd.command_name()),
            Self::Query(query) => write!(f, "Dispatchable::Query({})", query.query_name()),
            Self::Event(e) => write!(f, "Dispatchable::Event({})", e.event_type),
            Self::QueuedEvent(q) => write!(f, "Dispatchable::{q}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used)]
mod tests {
    use super::*;

    struct PlaceOrder {
        order_id: String,
    }

    impl Command for PlaceOrder {
        fn command_name(&self) -> &'static str {
            "PlaceOrder"
        }
    }

    #[test]
    fn command_wraps_and_downcasts() {
        let dispatchable = Dispatchable::command(PlaceOrder {
            order_id: "order-1".to_string(),
        });
        match dispatchable {
            Dispatchable::Command(cmd) => {
                assert_eq!(cmd.command_name(), "PlaceOrder");
                let cmd = cmd.as_any().downcast_ref::<PlaceOrder>().expect("downcast should succeed");
                assert_eq!(cmd.order_id, "order-1");
            }
            _ => panic!("expected Command variant"),
        }
    }

    #[test]
    fn queued_event_display() {
        let event = crate::event::SerializedEvent::new("OrderPlaced.v1".to_string(), vec![1], None);
        let queued = QueuedEvent::new(event, "SendConfirmationEmail".to_string());
        assert_eq!(format!("{queued}"), "QueuedEvent(OrderPlaced.v1 -> SendConfirmationEmail)");
    }
}
