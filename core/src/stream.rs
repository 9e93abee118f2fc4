//! Stream identification and positions.
//!
//! This module defines strong types for stream identification (`StreamId`),
//! positions within a stream or the global log (`Position`), and what a
//! subscription reads from (`SubscriptionTarget`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream ID: {0}")]
pub struct ParseStreamIdError(String);

/// Identifier of an ordered, append-only stream of events.
///
/// For example:
/// - `"order-12345"`
/// - `"integration-orders"` (a gateway destination)
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for internal use with trusted input)
///
/// # Examples
///
/// ```
/// use conveyor_core::stream::StreamId;
///
/// let stream_id = StreamId::new("order-12345");
/// assert_eq!(stream_id.as_str(), "order-12345");
///
/// let parsed: StreamId = "customer-abc".parse().unwrap();
/// assert_eq!(parsed, StreamId::new("customer-abc"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a new `StreamId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `StreamId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseStreamIdError("Stream ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Position of an event in a stream (stream revision) or in the global log.
///
/// Positions start at 0 for the first event and increase by 1 for every
/// event appended. "Nothing processed yet" is not a position: it is expressed
/// as `Option<Position>::None` everywhere in this workspace.
///
/// # Examples
///
/// ```
/// use conveyor_core::stream::Position;
///
/// let p0 = Position::new(0);
/// assert_eq!(p0.next(), Position::new(1));
/// assert_eq!(Position::new(5).value(), 5);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(u64);

impl Position {
    /// Position of the first event in a stream.
    pub const START: Self = Self(0);

    /// Create a new `Position` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the position number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next position (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Position to read from to resume after `last` (exclusive checkpoint).
    ///
    /// ```
    /// use conveyor_core::stream::Position;
    ///
    /// assert_eq!(Position::resume_after(None), Position::START);
    /// assert_eq!(Position::resume_after(Some(Position::new(4))), Position::new(5));
    /// ```
    #[must_use]
    pub const fn resume_after(last: Option<Self>) -> Self {
        match last {
            Some(position) => position.next(),
            None => Self::START,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Position> for u64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

/// Displays an optional position, rendering the start-of-stream sentinel as `none`.
///
/// ```
/// use conveyor_core::stream::{DisplayPosition, Position};
///
/// assert_eq!(DisplayPosition(None).to_string(), "none");
/// assert_eq!(DisplayPosition(Some(Position::new(3))).to_string(), "3");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DisplayPosition(pub Option<Position>);

impl fmt::Display for DisplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(position) => write!(f, "{position}"),
            None => write!(f, "none"),
        }
    }
}

/// What a subscription consumes.
///
/// A subscription bound to a single stream gets strict per-stream ordering and
/// checkpoints the stream revision. A subscription to the whole log
/// checkpoints the global position; ordering across streams then follows the
/// log's global order and handlers must not rely on anything stronger.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionTarget {
    /// A single stream.
    Stream(StreamId),
    /// Every stream, in global log order.
    All,
}

impl SubscriptionTarget {
    /// Subscribe to a single stream.
    #[must_use]
    pub fn stream(id: impl Into<StreamId>) -> Self {
        Self::Stream(id.into())
    }

    /// Returns true if the target is a single stream.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl fmt::Display for SubscriptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(id) => write!(f, "stream:{id}"),
            Self::All => write!(f, "$all"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod stream_id_tests {
        use super::*;

        #[test]
        fn from_string() {
            let id = StreamId::from("order-123");
            assert_eq!(id.as_str(), "order-123");

            let id2 = StreamId::from("order-456".to_string());
            assert_eq!(id2.into_inner(), "order-456");
        }

        #[test]
        fn parse_empty_or_blank_fails() {
            assert!("".parse::<StreamId>().is_err());
            assert!("   ".parse::<StreamId>().is_err());
        }

        #[test]
        fn display() {
            let id = StreamId::new("order-123");
            assert_eq!(format!("{id}"), "order-123");
        }
    }

    mod position_tests {
        use super::*;

        #[test]
        fn ordering_and_next() {
            let p1 = Position::new(1);
            assert!(Position::START < p1);
            assert_eq!(p1.next(), Position::new(2));
        }

        #[test]
        fn resume_after_sentinel_starts_at_zero() {
            assert_eq!(Position::resume_after(None), Position::START);
            assert_eq!(Position::resume_after(Some(Position::new(9))), Position::new(10));
        }

        #[test]
        fn option_ordering_puts_none_first() {
            // Checkpoint arbitration relies on None < Some(_).
            assert!(None < Some(Position::START));
        }
    }

    #[test]
    fn target_display() {
        assert_eq!(SubscriptionTarget::stream("S").to_string(), "stream:S");
        assert_eq!(SubscriptionTarget::All.to_string(), "$all");
    }
}
