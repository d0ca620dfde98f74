//! Time sources.
//!
//! All internal timing (event timestamps, rule dwell, cooldowns, staleness)
//! uses `now_monotonic()` — seconds since the clock's fixed epoch,
//! microsecond-resolved, never stepping backwards. Wall-clock time appears
//! only on stored records (alert trigger/ack/resolve stamps).
//!
//! Components never call `Instant::now()` directly; the orchestrator hands
//! every component a `SharedClock`, and tests substitute [`ManualClock`].

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A monotonic + wall time source.
pub trait Clock: Send + Sync + 'static {
    /// Seconds since this clock's epoch. Monotonic, µs-resolved.
    fn now_monotonic(&self) -> f64;

    /// Wall-clock time for record stamps only.
    fn now_wall(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock: `Instant`-backed monotonic time with the process start
/// as epoch, `Utc::now()` for record stamps.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_monotonic(&self) -> f64 {
        let micros = self.origin.elapsed().as_micros();
        micros as f64 / 1e6
    }

    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
///
/// `advance()` moves both the monotonic reading and the wall stamp, so
/// dwell/cooldown assertions and record stamps stay consistent.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

struct ManualState {
    monotonic: f64,
    wall: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(start_monotonic: f64, start_wall: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                monotonic: start_monotonic,
                wall: start_wall,
            }),
        }
    }

    pub fn shared(start_monotonic: f64) -> Arc<Self> {
        Arc::new(Self::new(start_monotonic, DateTime::<Utc>::UNIX_EPOCH))
    }

    /// Advance both time bases by `seconds` (must be non-negative).
    pub fn advance(&self, seconds: f64) {
        assert!(seconds >= 0.0, "clock cannot move backwards");
        let mut state = self.state.lock();
        state.monotonic += seconds;
        state.wall += chrono::Duration::microseconds((seconds * 1e6) as i64);
    }
}

impl Clock for ManualClock {
    fn now_monotonic(&self) -> f64 {
        self.state.lock().monotonic
    }

    fn now_wall(&self) -> DateTime<Utc> {
        self.state.lock().wall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_monotonic();
        let b = clock.now_monotonic();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_both_bases() {
        let clock = ManualClock::shared(100.0);
        let wall_before = clock.now_wall();
        clock.advance(2.5);
        assert_eq!(clock.now_monotonic(), 102.5);
        assert_eq!(
            (clock.now_wall() - wall_before).num_milliseconds(),
            2_500
        );
    }

    #[test]
    #[should_panic(expected = "cannot move backwards")]
    fn manual_clock_rejects_negative_advance() {
        ManualClock::shared(0.0).advance(-1.0);
    }
}
