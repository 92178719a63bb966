//! Wall-clock and monotonic time. Monotonic values are anchored at process
//! start, so only differences are meaningful.

use std::time::{Duration, Instant};

/// Timezone index encoding: `0..=108` maps UTC−12..UTC+14 in 15-minute steps
/// as `(index − 48) · 15 min`. Index 48 is UTC. The encoding is part of the
/// persisted option format, not a display concern.
pub const TZ_UTC_INDEX: u8 = 48;

#[derive(Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Wall-clock seconds since the Unix epoch.
    pub fn now_seconds(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Monotonic milliseconds since process start.
    pub fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Monotonic microseconds since process start.
    pub fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    /// Wall-clock seconds shifted by the configured timezone index.
    pub fn localized_now(&self, tz_index: u8) -> i64 {
        localize(self.now_seconds(), tz_index)
    }
}

/// Apply the timezone index offset to an epoch timestamp.
pub fn localize(now_seconds: i64, tz_index: u8) -> i64 {
    now_seconds + (i64::from(tz_index) - i64::from(TZ_UTC_INDEX)) * 900
}

/// Cooperative sleep; may over-sleep.
pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Spin against the monotonic clock. Only used for the microsecond-precision
/// pulse trains of the RF transmitter, where a cooperative sleep is too
/// coarse.
pub fn busy_wait_us(us: u64) {
    let deadline = Instant::now() + Duration::from_micros(us);
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
