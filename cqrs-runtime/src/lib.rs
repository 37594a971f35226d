//! # cqrs-runtime
//!
//! Small runtime helpers shared by the bus, the event-store and queue
//! backends, and the background job controller. Currently just retry with
//! exponential backoff; this crate is the place for other cross-cutting
//! runtime concerns (nothing else has needed one yet).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod retry;

pub use retry::{retry_with_backoff, retry_with_predicate, RetryPolicy, RetryPolicyBuilder};
