//! # cqrs-testing
//!
//! In-memory [`cqrs_core::EventStore`] and [`cqrs_core::Queue`] fakes, plus a
//! [`FixedClock`], so bus/router/controller tests run without a database.
//! `cqrs-postgres` keeps its own `testcontainers`-backed integration tests
//! for the real backends; this crate is what unit and component tests
//! against those traits reach for instead.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod event_store;
pub mod queue;

pub use event_store::InMemoryEventStore;
pub use queue::InMemoryQueue;

use chrono::{DateTime, Utc};
use cqrs_core::Clock;

/// Fixed clock for deterministic tests.
///
/// Always returns the same time, making tests reproducible.
///
/// # Example
///
/// ```
/// use cqrs_testing::FixedClock;
/// use cqrs_core::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// let time1 = clock.now();
/// let time2 = clock.now();
/// assert_eq!(time1, time2);
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// A clock fixed at `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// A default fixed clock for tests (2025-01-01 00:00:00 UTC).
///
/// # Panics
///
/// Panics if the hardcoded timestamp fails to parse, which never happens in
/// practice.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc),
    )
}
