//! `PostgreSQL`-backed [`cqrs_core::event_store::EventStore`] and
//! [`cqrs_core::queue::Queue`] implementations.
//!
//! Both share the same competing-consumer idiom: `FOR UPDATE SKIP LOCKED`
//! over a plain table, with an advisory lock guarding the event store's
//! per-stream version check and a lease timestamp governing who currently
//! owns a row. Schema setup runs inline (`CREATE TABLE IF NOT EXISTS`) the
//! first time a store is constructed against a pool, rather than through a
//! separate migration tool.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod event_store;
pub mod queue;

pub use event_store::PostgresEventStore;
pub use queue::{FailedMessage, PostgresQueue};
