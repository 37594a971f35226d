//! Stream identification and versioning types.
//!
//! An event stream is identified by the pair `(aggregate_type, owner_id)` — every
//! event belongs to exactly one stream, and a stream's events are totally ordered
//! by [`Version`]. This mirrors the `(type, owner)` columns the reference event
//! store indexes on: a stream is not a single opaque string but a type tag plus
//! the id of the aggregate instance that owns it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for parsing stream components from untrusted input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid stream component: {0}")]
pub struct ParseStreamIdError(String);

/// The type name of an aggregate, e.g. `"order"` or `"customer"`.
///
/// Aggregate types are registered once at startup alongside their command and
/// event handlers; the type name is also the table-name component used when a
/// store partitions streams physically (it never is, here — partitioning is by
/// column, not by table — but the name still has to be stable and non-empty).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateType(String);

impl AggregateType {
    /// Create an `AggregateType` from application-controlled data.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AggregateType {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("aggregate type cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for AggregateType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AggregateType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AggregateType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The id of the aggregate instance a stream belongs to.
///
/// Most owners are UUIDs, but the owner column is a plain string in the
/// reference store (some system aggregates use non-UUID owners), so this
/// stays a validated string rather than forcing `Uuid`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("owner id cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for OwnerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A stream identifier: the `(aggregate_type, owner_id)` pair events are
/// appended under and replayed from.
///
/// # Examples
///
/// ```
/// use cqrs_core::stream::StreamId;
///
/// let stream = StreamId::new("order", "order-12345");
/// assert_eq!(stream.aggregate_type().as_str(), "order");
/// assert_eq!(stream.owner_id().as_str(), "order-12345");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    aggregate_type: AggregateType,
    owner_id: OwnerId,
}

impl StreamId {
    #[must_use]
    pub fn new(aggregate_type: impl Into<AggregateType>, owner_id: impl Into<OwnerId>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            owner_id: owner_id.into(),
        }
    }

    #[must_use]
    pub const fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    #[must_use]
    pub const fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.owner_id)
    }
}

/// Event version number for optimistic concurrency control.
///
/// Versions start at 0 (the "empty stream" sentinel) and increment by 1 for
/// each event appended. The first event in a stream leaves it at `Version(1)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a stream with no events appended yet.
    pub const INITIAL: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    ///
    /// Uses wrapping arithmetic; reaching `u64::MAX` events on a single stream
    /// is not a realistic concern.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u64> for Version {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}
