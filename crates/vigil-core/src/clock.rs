//! Engine clock.
//!
//! Wall-clock epoch milliseconds are anchored once and then advanced by
//! `tokio::time::Instant`, so persisted timestamps and timer deadlines
//! agree with each other (and with tokio's paused clock in tests).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Epoch-millisecond clock driven by tokio's monotonic time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch_ms: u64,
    origin: Instant,
}

impl Clock {
    /// Anchor a new clock at the current wall-clock time.
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::starting_at(epoch_ms)
    }

    /// Anchor a clock at a fixed epoch (for deterministic tests).
    pub fn starting_at(epoch_ms: u64) -> Self {
        Self {
            epoch_ms,
            origin: Instant::now(),
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as u64
    }

    /// The tokio instant at which this clock reads `at_ms`.
    ///
    /// Timestamps already in the past map to "now".
    pub fn deadline(&self, at_ms: u64) -> Instant {
        let now = self.now_millis();
        Instant::now() + Duration::from_millis(at_ms.saturating_sub(now))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
