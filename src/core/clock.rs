//! Wall Clock
//!
//! All game timestamps are Unix epoch milliseconds. The clock is
//! injected so simulations and tests can drive time by hand.

use std::sync::atomic::{AtomicI64, Ordering};

/// Unix epoch milliseconds.
pub type Millis = i64;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current Unix time in milliseconds.
    fn now_ms(&self) -> Millis;
}

/// Clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    pub fn new(start_ms: Millis) -> Self {
        Self { now: AtomicI64::new(start_ms) }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, now_ms: Millis) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Advance by a number of milliseconds and return the new time.
    pub fn advance(&self, delta_ms: i64) -> Millis {
        self.now.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert whole seconds to milliseconds.
#[inline]
pub fn secs_to_ms(secs: u32) -> i64 {
    i64::from(secs) * 1000
}

/// Format a timestamp for logs.
pub fn format_ms(ms: Millis) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.advance(500), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(0), "1970-01-01T00:00:00+00:00");
    }
}
