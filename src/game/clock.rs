//! Multiplier Clock
//!
//! `multiplier = e^(k * elapsed_seconds)`. Every reading is computed from the
//! wall-clock start instant, never from a tick count, so late or skipped ticks
//! cannot delay or miss a crash.

use std::time::{Duration, Instant};

use crate::core::amount::Multiplier;

/// Outcome of one clock reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockReading {
    /// Still below the crash point.
    Climbing {
        /// Full-precision multiplier.
        multiplier: f64,
        /// Time since start.
        elapsed: Duration,
    },
    /// Crash point reached or passed.
    Crashed {
        /// Time since start.
        elapsed: Duration,
    },
}

/// Exponential multiplier curve.
#[derive(Debug, Clone, Copy)]
pub struct MultiplierClock {
    growth_rate: f64,
}

impl MultiplierClock {
    /// Create with growth rate `k` per second.
    pub fn new(growth_rate: f64) -> Self {
        Self { growth_rate }
    }

    /// Multiplier after `elapsed`.
    #[inline]
    pub fn multiplier_at(&self, elapsed: Duration) -> f64 {
        (self.growth_rate * elapsed.as_secs_f64()).exp()
    }

    /// Time the curve needs to reach `target`.
    pub fn time_to_reach(&self, target: Multiplier) -> Duration {
        let secs = target.as_f64().ln() / self.growth_rate;
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Read the clock at `now` for a round started at `started_at`.
    pub fn read(&self, started_at: Instant, now: Instant, crash_point: Multiplier) -> ClockReading {
        let elapsed = now.saturating_duration_since(started_at);
        let multiplier = self.multiplier_at(elapsed);

        if multiplier >= crash_point.as_f64() {
            ClockReading::Crashed { elapsed }
        } else {
            ClockReading::Climbing { multiplier, elapsed }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_one() {
        let clock = MultiplierClock::new(0.18);
        assert_eq!(clock.multiplier_at(Duration::ZERO), 1.0);
    }

    #[test]
    fn test_growth_curve() {
        let clock = MultiplierClock::new(0.18);
        let m = clock.multiplier_at(Duration::from_secs(10));
        assert!((m - 1.8f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn test_crash_point_one_crashes_immediately() {
        let clock = MultiplierClock::new(0.18);
        let start = Instant::now();
        assert!(matches!(
            clock.read(start, start, Multiplier::ONE),
            ClockReading::Crashed { .. }
        ));
    }

    #[test]
    fn test_read_uses_wall_clock_elapsed() {
        let clock = MultiplierClock::new(0.18);
        let start = Instant::now();
        let crash_point = Multiplier(200);
        let crash_at = clock.time_to_reach(crash_point);

        // A single late reading well past the crash time still detects it
        let late = start + crash_at + Duration::from_secs(30);
        assert!(matches!(clock.read(start, late, crash_point), ClockReading::Crashed { .. }));

        let early = start + crash_at - Duration::from_millis(10);
        match clock.read(start, early, crash_point) {
            ClockReading::Climbing { multiplier, .. } => assert!(multiplier < 2.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_full_precision_comparison() {
        let clock = MultiplierClock::new(0.18);
        let start = Instant::now();
        // Just below 1.50: would display as "1.50" but must not crash
        let secs = 1.4999f64.ln() / 0.18;
        let now = start + Duration::from_secs_f64(secs);
        assert!(matches!(
            clock.read(start, now, Multiplier(150)),
            ClockReading::Climbing { .. }
        ));
    }

    #[test]
    fn test_time_to_reach() {
        let clock = MultiplierClock::new(0.18);
        let t = clock.time_to_reach(Multiplier(200));
        assert!((t.as_secs_f64() - 2f64.ln() / 0.18).abs() < 1e-6);
        assert_eq!(clock.time_to_reach(Multiplier::ONE), Duration::ZERO);
    }
}
