//! Round State
//!
//! The single authoritative round. Only the engine loop mutates it; every
//! transition is checked against the lifecycle
//! `Waiting → Countdown → Running → Crashed → Countdown → …`.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::amount::Multiplier;

/// Monotonic round identifier (first round is 1).
pub type RoundId = u64;

/// Round lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Process just started; no round committed yet.
    Waiting,
    /// Betting window open; crash point committed.
    Countdown,
    /// Multiplier climbing.
    Running,
    /// Crash point reached; round is over.
    Crashed,
}

impl RoundPhase {
    /// Phase that must follow this one.
    pub fn next(self) -> RoundPhase {
        match self {
            RoundPhase::Waiting => RoundPhase::Countdown,
            RoundPhase::Countdown => RoundPhase::Running,
            RoundPhase::Running => RoundPhase::Crashed,
            RoundPhase::Crashed => RoundPhase::Countdown,
        }
    }
}

/// Illegal lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid round transition {from:?} -> {to:?}")]
pub struct TransitionError {
    /// Phase before.
    pub from: RoundPhase,
    /// Requested phase.
    pub to: RoundPhase,
}

/// The current round.
#[derive(Debug, Clone)]
pub struct RoundState {
    /// Round identifier.
    pub id: RoundId,
    /// Current phase.
    pub phase: RoundPhase,
    /// Committed crash point (not public until crashed).
    crash_point: Multiplier,
    /// Live multiplier (full precision).
    multiplier: f64,
    /// Past crash points, newest first.
    history: Vec<Multiplier>,
    /// History bound.
    history_len: usize,
}

impl RoundState {
    /// Fresh state in `Waiting`.
    pub fn new(history_len: usize) -> Self {
        Self {
            id: 0,
            phase: RoundPhase::Waiting,
            crash_point: Multiplier::ONE,
            multiplier: 1.0,
            history: Vec::with_capacity(history_len + 1),
            history_len,
        }
    }

    fn transition(&mut self, to: RoundPhase) -> Result<(), TransitionError> {
        if self.phase.next() != to {
            return Err(TransitionError { from: self.phase, to });
        }
        self.phase = to;
        Ok(())
    }

    /// Commit a new round with its crash point.
    pub fn begin_countdown(&mut self, crash_point: Multiplier) -> Result<RoundId, TransitionError> {
        self.transition(RoundPhase::Countdown)?;
        self.id += 1;
        self.crash_point = crash_point;
        self.multiplier = 1.0;
        Ok(self.id)
    }

    /// Start the clock.
    pub fn begin_running(&mut self) -> Result<(), TransitionError> {
        self.transition(RoundPhase::Running)?;
        self.multiplier = 1.0;
        Ok(())
    }

    /// Record a clock reading; never moves backwards.
    pub fn advance_multiplier(&mut self, value: f64) {
        if self.phase == RoundPhase::Running && value > self.multiplier {
            self.multiplier = value.min(self.crash_point.as_f64());
        }
    }

    /// Freeze at the crash point and record history.
    pub fn crash(&mut self) -> Result<Multiplier, TransitionError> {
        self.transition(RoundPhase::Crashed)?;
        self.multiplier = self.crash_point.as_f64();
        self.history.insert(0, self.crash_point);
        self.history.truncate(self.history_len);
        Ok(self.crash_point)
    }

    /// Committed crash point. Callers decide who may see it.
    pub fn crash_point(&self) -> Multiplier {
        self.crash_point
    }

    /// Live multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Past crash points, newest first.
    pub fn history(&self) -> &[Multiplier] {
        &self.history
    }

    /// Public view of the round, safe for any audience.
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_id: self.id,
            phase: self.phase,
            multiplier: match self.phase {
                RoundPhase::Running | RoundPhase::Crashed => Some(self.multiplier),
                _ => None,
            },
            history: self.history.clone(),
        }
    }
}

/// Public round view. Never carries an unrevealed crash point.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSnapshot {
    /// Round identifier.
    pub round_id: RoundId,
    /// Phase.
    pub phase: RoundPhase,
    /// Live multiplier while running, final value once crashed.
    pub multiplier: Option<f64>,
    /// Past crash points, newest first.
    pub history: Vec<Multiplier>,
}

impl Default for RoundSnapshot {
    fn default() -> Self {
        Self {
            round_id: 0,
            phase: RoundPhase::Waiting,
            multiplier: None,
            history: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run_round(state: &mut RoundState, crash_point: Multiplier) {
        state.begin_countdown(crash_point).unwrap();
        state.begin_running().unwrap();
        state.crash().unwrap();
    }

    #[test]
    fn test_lifecycle() {
        let mut state = RoundState::new(20);
        assert_eq!(state.phase, RoundPhase::Waiting);

        let id = state.begin_countdown(Multiplier(350)).unwrap();
        assert_eq!(id, 1);
        assert_eq!(state.phase, RoundPhase::Countdown);

        state.begin_running().unwrap();
        assert_eq!(state.phase, RoundPhase::Running);
        assert_eq!(state.multiplier(), 1.0);

        state.advance_multiplier(2.0);
        assert_eq!(state.multiplier(), 2.0);

        let crashed_at = state.crash().unwrap();
        assert_eq!(crashed_at, Multiplier(350));
        assert_eq!(state.multiplier(), 3.5);
        assert_eq!(state.history(), &[Multiplier(350)]);

        assert_eq!(state.begin_countdown(Multiplier(120)).unwrap(), 2);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut state = RoundState::new(20);
        assert!(state.begin_running().is_err());
        assert!(state.crash().is_err());

        state.begin_countdown(Multiplier(200)).unwrap();
        let err = state.begin_countdown(Multiplier(200)).unwrap_err();
        assert_eq!(err.from, RoundPhase::Countdown);
        assert_eq!(err.to, RoundPhase::Countdown);
    }

    #[test]
    fn test_multiplier_monotonic() {
        let mut state = RoundState::new(20);
        state.begin_countdown(Multiplier(500)).unwrap();

        // Ignored outside running
        state.advance_multiplier(3.0);
        assert_eq!(state.multiplier(), 1.0);

        state.begin_running().unwrap();
        state.advance_multiplier(2.0);
        state.advance_multiplier(1.5);
        assert_eq!(state.multiplier(), 2.0);

        // Never exceeds the crash point
        state.advance_multiplier(9.0);
        assert_eq!(state.multiplier(), 5.0);
    }

    #[test]
    fn test_snapshot_hides_crash_point() {
        let mut state = RoundState::new(20);
        state.begin_countdown(Multiplier(777)).unwrap();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.phase, RoundPhase::Countdown);
        assert_eq!(snapshot.multiplier, None);
    }

    #[test]
    fn test_history_newest_first_and_bounded() {
        let mut state = RoundState::new(20);
        for i in 0..25u32 {
            run_round(&mut state, Multiplier(100 + i));
        }
        let history = state.history();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0], Multiplier(124));
        assert_eq!(history[19], Multiplier(105));
    }

    proptest! {
        #[test]
        fn prop_history_bounded(rounds in 0usize..60, len in 1usize..30) {
            let mut state = RoundState::new(len);
            for i in 0..rounds {
                run_round(&mut state, Multiplier(100 + i as u32));
            }
            prop_assert_eq!(state.history().len(), rounds.min(len));
            if rounds > 0 {
                prop_assert_eq!(state.history()[0], Multiplier(100 + rounds as u32 - 1));
            }
        }
    }
}
