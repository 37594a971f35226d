//! The umbrella error type handlers, middleware and ports deal in.
//!
//! Mirrors the reference implementation's `errors.Error{Code, Message}`: a
//! small, caller-facing error with a code, plus a `block` step that hides
//! anything not explicitly recognized behind a generic internal error so
//! internals never leak across a port boundary.

use crate::credentials::Forbidden;
use crate::event_store::EventStoreError;
use crate::registry::RegistryError;
use thiserror::Error;

/// The framework-wide error type returned from command/query dispatch,
/// queue processing, and port execution.
#[derive(Error, Debug)]
pub enum FrameworkError {
    /// The caller's credentials didn't satisfy a required scope group.
    #[error("forbidden")]
    Forbidden,

    /// No handler is registered for a command.
    #[error("no handler registered for command: {0}")]
    NoCommandHandler(String),

    /// No handler is registered for a query.
    #[error("no handler registered for query: {0}")]
    NoQueryHandler(String),

    /// A query was dispatched with an invalid result pointer.
    #[error("invalid query result destination")]
    InvalidQueryResult,

    /// Caller-supplied input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The event store rejected an operation.
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The message registry rejected an operation.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The durable queue rejected an operation.
    #[error("queue error: {0}")]
    Queue(String),

    /// A handler or port panicked; the panic payload was captured and
    /// converted to a message.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Forbidden> for FrameworkError {
    fn from(_: Forbidden) -> Self {
        Self::Forbidden
    }
}

impl FrameworkError {
    /// A stable, caller-facing status code, loosely mirroring HTTP status
    /// semantics without depending on an HTTP crate.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::NoCommandHandler(_) | Self::NoQueryHandler(_) => 404,
            Self::InvalidQueryResult | Self::Validation(_) => 400,
            Self::EventStore(_) | Self::Registry(_) | Self::Queue(_) | Self::Internal(_) => 500,
        }
    }

    /// Collapse this error down to the message that's safe to return across
    /// a port boundary (to an API client, a CLI user, etc).
    ///
    /// Anything with a 5xx code is replaced with a generic message — the
    /// detail stays in the server-side log, not the response. Mirrors the
    /// reference implementation's `Block`.
    #[must_use]
    pub fn external_message(&self) -> String {
        if self.code() >= 500 {
            "internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_maps_to_403() {
        assert_eq!(FrameworkError::Forbidden.code(), 403);
    }

    #[test]
    fn no_command_handler_maps_to_404() {
        assert_eq!(FrameworkError::NoCommandHandler("Ping".to_string()).code(), 404);
    }

    #[test]
    fn internal_errors_are_blocked_externally() {
        let err = FrameworkError::Internal("leaked db connection string".to_string());
        assert_eq!(err.external_message(), "internal server error");
    }

    #[test]
    fn client_errors_are_not_blocked() {
        let err = FrameworkError::Validation("order_id is required".to_string());
        assert_eq!(err.external_message(), "validation failed: order_id is required");
    }

    #[test]
    fn forbidden_converts_from_scope_enforcement_failure() {
        let err: FrameworkError = Forbidden.into();
        assert!(matches!(err, FrameworkError::Forbidden));
    }
}
