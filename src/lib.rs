//! # Crash Round Server
//!
//! Authoritative engine for a multiplayer crash betting round, with a
//! WebSocket front end.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CRASH ROUND SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Primitives                               │
//! │  ├── amount.rs    - Two-decimal money and multipliers        │
//! │  └── rng.rs       - Xorshift128+ PRNG                        │
//! │                                                              │
//! │  game/            - Round logic (single authoritative loop)  │
//! │  ├── crash_point.rs - Crash point generation                 │
//! │  ├── upcoming.rs  - Look-ahead queue                         │
//! │  ├── state.rs     - Round lifecycle and history              │
//! │  ├── clock.rs     - Exponential multiplier clock             │
//! │  ├── settlement.rs- Bets, cash-outs, forced-loss sweep       │
//! │  ├── events.rs    - Engine events and audiences              │
//! │  └── engine.rs    - The round loop                           │
//! │                                                              │
//! │  store/           - Account balance contract                 │
//! │                                                              │
//! │  network/         - Networking                               │
//! │  ├── server.rs    - WebSocket server                         │
//! │  ├── protocol.rs  - Message types                            │
//! │  ├── broadcast.rs - Audience-aware fanout                    │
//! │  └── auth.rs      - JWT validation                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Round Guarantees
//!
//! - One loop owns the round; phases never overlap
//! - The crash point is committed before betting opens and revealed only
//!   when the round ends (privileged observers see the queue ahead)
//! - Crash detection reads the wall clock, so late ticks never miss it
//! - Every wager settles exactly once: won by cash-out or lost at crash

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use core::amount::{Amount, Multiplier};
pub use core::rng::RoundRng;
pub use game::engine::RoundEngine;
pub use game::settlement::{SettlementCoordinator, SettlementError};
pub use store::{AccountId, AccountStore, InMemoryAccountStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
