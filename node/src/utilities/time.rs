use std::time::Instant;

use chrono::Utc;
use lazy_static::lazy_static;

lazy_static! {
    static ref PROCESS_START: Instant = Instant::now();
}

pub(crate) struct WallClock;

impl WallClock {
    /// Seconds since the Unix epoch with sub-second precision.
    pub(crate) fn unix_now() -> f64 {
        Utc::now().timestamp_micros() as f64 / 1e6
    }
}

/// Monotonic seconds since process start.
pub(crate) fn monotonic_secs() -> f64 {
    PROCESS_START.elapsed().as_secs_f64()
}
