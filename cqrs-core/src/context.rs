//! Request-scoped context threaded explicitly through dispatch, the queue,
//! and the background job controller.
//!
//! The reference implementation leans on Go's ambient `context.Context` for
//! cancellation, correlation ids, and a handful of well-known values (the
//! authenticated caller, the job id a handler is running under). Rust has no
//! equivalent ambient value, so [`DispatchContext`] makes the same
//! information an explicit, cheaply-cloneable value passed alongside every
//! command, query, and event. Cancellation is carried via
//! [`tokio_util::sync::CancellationToken`], the idiomatic stand-in for a
//! cancellable `context.Context` in a Tokio application.

use crate::credentials::Credentials;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context carried through a single dispatch: who's calling, what ties this
/// call to others, and whether it should still be running.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    correlation_id: Uuid,
    job_id: Option<Uuid>,
    credentials: Credentials,
    cancellation: CancellationToken,
    extra: HashMap<String, String>,
}

impl DispatchContext {
    /// A fresh root context with a new correlation id, no job id, and no
    /// authenticated caller.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            job_id: None,
            credentials: Credentials::blank(),
            cancellation: CancellationToken::new(),
            extra: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Derive a child context that shares this context's correlation id,
    /// job id and credentials, but whose cancellation token is a child of
    /// this one — cancelling the parent cancels the child, but the child can
    /// be cancelled independently without affecting siblings.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id,
            job_id: self.job_id,
            credentials: self.credentials.clone(),
            cancellation: self.cancellation.child_token(),
            extra: self.extra.clone(),
        }
    }

    #[must_use]
    pub const fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    #[must_use]
    pub const fn job_id(&self) -> Option<Uuid> {
        self.job_id
    }

    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    #[must_use]
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(key.into(), value.into());
    }
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The serializable slice of a [`DispatchContext`] carried across the
/// durable queue: everything except the cancellation token, which is
/// per-process and meaningless once a message has been written to storage
/// and picked up by a different consumer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueContext {
    pub correlation_id: Uuid,
    pub job_id: Option<Uuid>,
    pub credentials: Credentials,
    pub extra: HashMap<String, String>,
}

impl From<&DispatchContext> for QueueContext {
    fn from(ctx: &DispatchContext) -> Self {
        Self {
            correlation_id: ctx.correlation_id,
            job_id: ctx.job_id,
            credentials: ctx.credentials.clone(),
            extra: ctx.extra.clone(),
        }
    }
}

impl QueueContext {
    /// Rehydrate a [`DispatchContext`] on the consuming side, with a fresh
    /// cancellation token scoped to this delivery.
    #[must_use]
    pub fn into_dispatch_context(self) -> DispatchContext {
        DispatchContext {
            correlation_id: self.correlation_id,
            job_id: self.job_id,
            credentials: self.credentials,
            cancellation: CancellationToken::new(),
            extra: self.extra,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn new_context_has_no_credentials() {
        let ctx = DispatchContext::new();
        assert!(!ctx.credentials().is_valid());
        assert!(ctx.job_id().is_none());
    }

    #[test]
    fn child_inherits_correlation_and_credentials() {
        let creds = Credentials::new(Uuid::new_v4(), vec!["orders:read".to_string()]);
        let parent = DispatchContext::new().with_credentials(creds.clone());
        let child = parent.child();

        assert_eq!(child.correlation_id(), parent.correlation_id());
        assert_eq!(child.credentials(), &creds);
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let parent = DispatchContext::new();
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_does_not_cancel_parent() {
        let parent = DispatchContext::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn queue_context_round_trips_through_dispatch_context() {
        let creds = Credentials::new(Uuid::new_v4(), vec!["orders:read".to_string()]);
        let mut ctx = DispatchContext::new().with_credentials(creds.clone()).with_job_id(Uuid::new_v4());
        ctx.set_extra("trace", "abc123");

        let queue_ctx = QueueContext::from(&ctx);
        let bytes = bincode::serialize(&queue_ctx).expect("serialize should succeed");
        let decoded: QueueContext = bincode::deserialize(&bytes).expect("deserialize should succeed");
        let rehydrated = decoded.into_dispatch_context();

        assert_eq!(rehydrated.correlation_id(), ctx.correlation_id());
        assert_eq!(rehydrated.job_id(), ctx.job_id());
        assert_eq!(rehydrated.credentials(), &creds);
        assert_eq!(rehydrated.extra("trace"), Some("abc123"));
    }

    #[test]
    fn extra_bucket_round_trips() {
        let mut ctx = DispatchContext::new();
        assert_eq!(ctx.extra("trace"), None);
        ctx.set_extra("trace", "abc123");
        assert_eq!(ctx.extra("trace"), Some("abc123"));
    }
}
