use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

pub fn ms_since_epoch() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Hands out acceptance timestamps that never go backwards, even if the
/// wall clock does.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_ms: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> i64 {
        self.observe(ms_since_epoch())
    }

    fn observe(&self, wall_ms: i64) -> i64 {
        let prev = self.last_ms.fetch_max(wall_ms, Ordering::AcqRel);
        prev.max(wall_ms)
    }
}
