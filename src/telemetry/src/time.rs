//! Wall-clock and monotone time helpers.
//!
//! Span timestamps are unsigned milliseconds since the Unix epoch, but within
//! one process span ordering must follow a monotone clock. `MonotonicClock`
//! anchors an `Instant` to the wall clock once, so `end >= start` holds even
//! if the system clock steps backwards mid-span.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A wall-clock reading backed by a monotone source.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch_ms: u64,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch_ms: now_unix_ms(),
            anchor: Instant::now(),
        }
    }

    /// Milliseconds since the Unix epoch, guaranteed non-decreasing.
    pub fn now_ms(&self) -> u64 {
        self.epoch_ms + self.anchor.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
