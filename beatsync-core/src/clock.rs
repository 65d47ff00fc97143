use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Server time as UNIX epoch milliseconds, derived from a monotonic base.
///
/// The wall clock is read exactly once, at construction. Every reading after
/// that is the monotonic elapsed time added to that base, so scheduled
/// execution timestamps can never run backwards under clock adjustments.
#[derive(Debug, Clone)]
pub struct Clock {
    base: Instant,
    epoch_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is past the epoch")
            .as_millis() as u64;

        Self {
            base: Instant::now(),
            epoch_ms,
        }
    }

    /// Current server time in whole milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.epoch_ms + self.base.elapsed().as_millis() as u64
    }

    /// Current server time with sub-millisecond precision, for time-sync replies.
    pub fn now_precise_ms(&self) -> f64 {
        self.epoch_ms as f64 + self.base.elapsed().as_secs_f64() * 1000.
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
