//! Round Logic Module
//!
//! Everything that decides what happens in a round. Networking lives in
//! `network/`; this module only publishes [`events::RoundEvent`]s.
//!
//! ## Module Structure
//!
//! - `crash_point`: Crash point generation (inverse-uniform draw, capped)
//! - `upcoming`: Look-ahead queue of committed crash points
//! - `state`: Round lifecycle and history
//! - `clock`: Wall-clock exponential multiplier
//! - `settlement`: Wager placement, cash-out and forced-loss sweep
//! - `events`: Engine events and audiences
//! - `engine`: The authoritative round loop

pub mod crash_point;
pub mod upcoming;
pub mod state;
pub mod clock;
pub mod settlement;
pub mod events;
pub mod engine;

// Re-export key types
pub use crash_point::{CrashPointGenerator, CrashPointSource, ScriptedCrashPoints};
pub use upcoming::{UpcomingQueue, QueueError};
pub use state::{RoundId, RoundPhase, RoundSnapshot, RoundState};
pub use clock::{ClockReading, MultiplierClock};
pub use settlement::{PayoutClaim, SettlementCoordinator, SettlementError, Wager, WagerId, WagerStatus};
pub use events::{Audience, EventSink, RoundEvent};
pub use engine::{EngineWatch, RoundEngine};
