//! Crash Point Generation
//!
//! Heavy-tailed draw: `raw = 1 / r` for uniform `r` in (0, 1], clamped to the
//! configured cap and rounded to two decimals. Most rounds end below 3x; a
//! few run very long.

use crate::core::amount::Multiplier;
use crate::core::rng::RoundRng;

/// Substitute for a zero draw.
pub const ZERO_DRAW_EPSILON: f64 = 0.000_001;

/// Map a uniform draw to a crash point.
///
/// Pure; `r` outside (0, 1] is clamped into it.
pub fn crash_point_from_unit(r: f64, max: Multiplier) -> Multiplier {
    let r = if r.is_nan() || r <= 0.0 {
        ZERO_DRAW_EPSILON
    } else {
        r.min(1.0)
    };

    let raw = 1.0 / r;
    let capped = raw.min(max.as_f64());

    Multiplier::from_f64_rounded(capped).min(max)
}

/// Source of crash points.
pub trait CrashPointSource: Send + Sync {
    /// Draw the next crash point.
    fn generate(&mut self) -> Multiplier;
}

/// Crash point generator backed by [`RoundRng`].
#[derive(Debug, Clone)]
pub struct CrashPointGenerator {
    rng: RoundRng,
    max: Multiplier,
}

impl CrashPointGenerator {
    /// Create with an explicit RNG.
    pub fn new(rng: RoundRng, max: Multiplier) -> Self {
        Self { rng, max }
    }

    /// Create seeded from OS entropy.
    pub fn from_entropy(max: Multiplier) -> Self {
        Self::new(RoundRng::from_entropy(), max)
    }

    /// Configured cap.
    pub fn max(&self) -> Multiplier {
        self.max
    }
}

impl CrashPointSource for CrashPointGenerator {
    fn generate(&mut self) -> Multiplier {
        let r = self.rng.next_unit_open_closed();
        crash_point_from_unit(r, self.max)
    }
}

/// Replays a fixed list of crash points, then repeats the last one.
#[derive(Debug, Clone)]
pub struct ScriptedCrashPoints {
    points: Vec<Multiplier>,
    next: usize,
}

impl ScriptedCrashPoints {
    /// Create from a non-empty list.
    pub fn new(points: Vec<Multiplier>) -> Self {
        Self { points, next: 0 }
    }
}

impl CrashPointSource for ScriptedCrashPoints {
    fn generate(&mut self) -> Multiplier {
        let point = self
            .points
            .get(self.next)
            .or_else(|| self.points.last())
            .copied()
            .unwrap_or(Multiplier::ONE);
        self.next += 1;
        point
    }
}
