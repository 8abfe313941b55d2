//! Injected time source
//!
//! All subsystems receive an `Arc<dyn Clock>` instead of reading ambient
//! statics. The wall clock drives ingestion timestamps and TTL eviction; the
//! monotonic clock drives the campaign timeline so that wall-clock jumps
//! (NTP corrections, GPS sync) never fire or starve timeline events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A paired reading of both clocks, taken at the same moment.
///
/// Campaign start/expiry times arrive as wall-clock epoch milliseconds but
/// the timeline sleeps on the monotonic clock; `monotonic_for` converts one
/// into the other relative to this reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePoint {
    /// Milliseconds since the Unix epoch.
    pub system_time_ms: u64,
    /// Milliseconds on the monotonic clock (arbitrary origin).
    pub monotonic_time_ms: u64,
}

impl TimePoint {
    /// Project a wall-clock timestamp onto the monotonic axis.
    pub fn monotonic_for(&self, system_time_ms: u64) -> u64 {
        if system_time_ms >= self.system_time_ms {
            self.monotonic_time_ms
                .saturating_add(system_time_ms - self.system_time_ms)
        } else {
            self.monotonic_time_ms
                .saturating_sub(self.system_time_ms - system_time_ms)
        }
    }
}

/// Time source injected into every subsystem.
pub trait Clock: Send + Sync {
    /// Wall-clock milliseconds since the Unix epoch.
    fn system_time_ms(&self) -> u64;

    /// Monotonic milliseconds since an arbitrary per-process origin.
    fn monotonic_time_ms(&self) -> u64;

    /// Read both clocks together.
    fn time_point(&self) -> TimePoint {
        TimePoint {
            system_time_ms: self.system_time_ms(),
            monotonic_time_ms: self.monotonic_time_ms(),
        }
    }
}

/// Production clock: chrono wall clock plus `Instant` for monotonic time.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
        })
    }
}

impl Clock for SystemClock {
    fn system_time_ms(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis();
        if now < 0 {
            0
        } else {
            now as u64
        }
    }

    fn monotonic_time_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for tests.
///
/// Both axes advance together through `advance`; `set_system_time_ms` moves
/// only the wall clock, simulating a wall-clock jump.
pub struct ManualClock {
    system_ms: AtomicU64,
    monotonic_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(system_time_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            system_ms: AtomicU64::new(system_time_ms),
            monotonic_ms: AtomicU64::new(0),
        })
    }

    pub fn advance(&self, ms: u64) {
        self.system_ms.fetch_add(ms, Ordering::SeqCst);
        self.monotonic_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_system_time_ms(&self, ms: u64) {
        self.system_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn system_time_ms(&self) -> u64 {
        self.system_ms.load(Ordering::SeqCst)
    }

    fn monotonic_time_ms(&self) -> u64 {
        self.monotonic_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_projection_future() {
        let point = TimePoint {
            system_time_ms: 10_000,
            monotonic_time_ms: 500,
        };
        assert_eq!(point.monotonic_for(12_500), 3_000);
    }

    #[test]
    fn test_monotonic_projection_past_clamps() {
        let point = TimePoint {
            system_time_ms: 10_000,
            monotonic_time_ms: 500,
        };
        // A start time already in the past maps to "now or earlier", never
        // underflows.
        assert_eq!(point.monotonic_for(9_800), 300);
        assert_eq!(point.monotonic_for(1_000), 0);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.system_time_ms(), 1_000);
        assert_eq!(clock.monotonic_time_ms(), 0);
        clock.advance(250);
        assert_eq!(clock.system_time_ms(), 1_250);
        assert_eq!(clock.monotonic_time_ms(), 250);
        clock.set_system_time_ms(500);
        assert_eq!(clock.system_time_ms(), 500);
        assert_eq!(clock.monotonic_time_ms(), 250);
    }
}
