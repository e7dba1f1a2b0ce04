//! Core primitives.
//!
//! Exact two-decimal money/multiplier values and the round PRNG.

pub mod amount;
pub mod rng;

// Re-export core types
pub use amount::{Amount, Multiplier};
pub use rng::RoundRng;
