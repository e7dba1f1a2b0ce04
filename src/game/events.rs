//! Round Events
//!
//! Everything the engine announces. Each event knows its audience; the
//! broadcast layer decides how it is rendered for the wire.

use std::time::Duration;

use crate::core::amount::{Amount, Multiplier};
use crate::game::settlement::{Settlement, WagerId};
use crate::game::state::RoundId;
use crate::store::AccountId;

/// Who may receive an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    /// Every connected client, including privileged ones.
    Public,
    /// Privileged observers only.
    Privileged,
    /// Connections authenticated as one account.
    Account(AccountId),
}

/// Engine event.
#[derive(Clone, Debug, PartialEq)]
pub enum RoundEvent {
    /// Betting window tick.
    Countdown {
        /// Round in countdown.
        round_id: RoundId,
        /// Time left in the window.
        remaining: Duration,
    },

    /// Queued crash points after the current round's was taken.
    UpcomingPreview {
        /// Round that just consumed the head.
        round_id: RoundId,
        /// Up to the preview length, next first.
        upcoming: Vec<Multiplier>,
    },

    /// Clock started. Carries no crash point.
    RoundStarted {
        /// Round now running.
        round_id: RoundId,
    },

    /// Live multiplier reading.
    MultiplierTick {
        /// Running round.
        round_id: RoundId,
        /// Full-precision multiplier.
        multiplier: f64,
        /// Time since the round started.
        elapsed: Duration,
    },

    /// Round crashed; crash point revealed.
    RoundEnded {
        /// Finished round.
        round_id: RoundId,
        /// Revealed crash point.
        crash_point: Multiplier,
        /// Past crash points, newest first.
        history: Vec<Multiplier>,
    },

    /// A wager was auto-settled and the account credited.
    BalanceUpdated {
        /// Credited account.
        account: AccountId,
        /// Settled wager.
        wager_id: WagerId,
        /// Multiplier paid.
        multiplier: Multiplier,
        /// Amount credited.
        payout: Amount,
        /// Balance after the credit.
        balance: Amount,
    },
}

impl RoundEvent {
    /// Delivery audience.
    pub fn audience(&self) -> Audience {
        match self {
            RoundEvent::UpcomingPreview { .. } => Audience::Privileged,
            RoundEvent::BalanceUpdated { account, .. } => Audience::Account(*account),
            _ => Audience::Public,
        }
    }

    /// Round the event belongs to, if any.
    pub fn round_id(&self) -> Option<RoundId> {
        match self {
            RoundEvent::Countdown { round_id, .. }
            | RoundEvent::UpcomingPreview { round_id, .. }
            | RoundEvent::RoundStarted { round_id }
            | RoundEvent::MultiplierTick { round_id, .. }
            | RoundEvent::RoundEnded { round_id, .. } => Some(*round_id),
            RoundEvent::BalanceUpdated { .. } => None,
        }
    }
}

impl From<&Settlement> for RoundEvent {
    fn from(settlement: &Settlement) -> Self {
        RoundEvent::BalanceUpdated {
            account: settlement.wager.account,
            wager_id: settlement.wager.id,
            multiplier: settlement.wager.settled_multiplier.unwrap_or_default(),
            payout: settlement.payout,
            balance: settlement.balance,
        }
    }
}

/// Destination for engine events.
pub trait EventSink: Send + Sync {
    /// Deliver an event to its audience. Must not block.
    fn publish(&self, event: RoundEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audiences() {
        let preview = RoundEvent::UpcomingPreview { round_id: 1, upcoming: vec![Multiplier(200)] };
        assert_eq!(preview.audience(), Audience::Privileged);

        let started = RoundEvent::RoundStarted { round_id: 1 };
        assert_eq!(started.audience(), Audience::Public);

        let account = AccountId::new([3; 16]);
        let balance = RoundEvent::BalanceUpdated {
            account,
            wager_id: WagerId::nil(),
            multiplier: Multiplier(200),
            payout: Amount::from_units(20),
            balance: Amount::from_units(110),
        };
        assert_eq!(balance.audience(), Audience::Account(account));
        assert_eq!(balance.round_id(), None);
    }
}
