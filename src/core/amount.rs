//! Two-Decimal Fixed-Point Values
//!
//! Money and settled multipliers are stored as integer hundredths so that
//! payouts are exact. Floats only appear in the live multiplier curve and at
//! presentation boundaries.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Amount(1050)      = 10.50 units   (u64 hundredths)  │
//! │  Multiplier(350)   = 3.50x         (u32 hundredths)  │
//! │  payout            = 1050 * 350 / 100 = 3675 = 36.75 │
//! └──────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::ops::{Add, Sub};
use serde::{Serialize, Deserialize};

/// Hundredths per whole unit.
pub const SCALE: u64 = 100;

// =============================================================================
// AMOUNT
// =============================================================================

/// Non-negative money amount in hundredths of a unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    /// Zero.
    pub const ZERO: Amount = Amount(0);

    /// Create from raw hundredths.
    pub const fn from_hundredths(raw: u64) -> Self {
        Self(raw)
    }

    /// Create from whole units.
    pub const fn from_units(units: u64) -> Self {
        Self(units * SCALE)
    }

    /// Raw hundredths.
    pub const fn hundredths(self) -> u64 {
        self.0
    }

    /// Checked subtraction (None on underflow).
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Saturating addition.
    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    /// Scale by a multiplier, truncating to the hundredth.
    ///
    /// Uses u128 intermediate; saturates at `u64::MAX`.
    pub fn times(self, multiplier: Multiplier) -> Amount {
        let wide = self.0 as u128 * multiplier.0 as u128 / SCALE as u128;
        Amount(u64::try_from(wide).unwrap_or(u64::MAX))
    }

    /// Signed value in hundredths (for profit reporting).
    pub fn as_signed(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Value as a float for display.
    pub fn to_float(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        self.saturating_add(rhs)
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / SCALE, self.0 % SCALE)
    }
}

// =============================================================================
// MULTIPLIER
// =============================================================================

/// Payout multiple in hundredths (`Multiplier(100)` is 1.00x).
///
/// Used for crash points, auto cash-out targets and settled multipliers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(pub u32);

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl Multiplier {
    /// 1.00x
    pub const ONE: Multiplier = Multiplier(100);

    /// Create from raw hundredths.
    pub const fn from_hundredths(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw hundredths.
    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Round a float multiple to the nearest hundredth, never below 1.00x.
    pub fn from_f64_rounded(value: f64) -> Self {
        Self::from_scaled((value * SCALE as f64).round())
    }

    /// Truncate a float multiple down to the hundredth, never below 1.00x.
    ///
    /// A cash-out settles at what the curve has provably reached.
    pub fn from_f64_floor(value: f64) -> Self {
        Self::from_scaled((value * SCALE as f64).floor())
    }

    fn from_scaled(scaled: f64) -> Self {
        if !scaled.is_finite() {
            return Self(u32::MAX);
        }
        let clamped = scaled.clamp(SCALE as f64, u32::MAX as f64);
        Self(clamped as u32)
    }

    /// Value as a float.
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / SCALE as u32, self.0 % SCALE as u32)
    }
}

/// Round a live multiplier to two decimals for the wire.
#[inline]
pub fn round_for_display(value: f64) -> f64 {
    (value * SCALE as f64).round() / SCALE as f64
}
