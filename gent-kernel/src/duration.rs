//! A millisecond timestamp relative to a root context's start.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Milliseconds elapsed since the owning root [`ExecutionContext`](crate::context::ExecutionContext)
/// started. Not a wall-clock timestamp — comparable across a run without
/// giving tests a real-time dependency, and stable to serialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampMs(pub u64);

impl TimestampMs {
    /// The zero timestamp, i.e. the instant a root context starts.
    pub const ZERO: TimestampMs = TimestampMs(0);

    /// Compute the timestamp for `now` relative to `root_start`.
    pub fn since(root_start: Instant, now: Instant) -> Self {
        TimestampMs(now.saturating_duration_since(root_start).as_millis() as u64)
    }
}

impl fmt::Display for TimestampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<u64> for TimestampMs {
    fn from(ms: u64) -> Self {
        TimestampMs(ms)
    }
}
