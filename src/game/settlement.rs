//! Wager Settlement
//!
//! Ties player bets to the round clock. All wager state lives in one ledger
//! behind a mutex. A cash-out *claims* its wager under the lock, which decides
//! the outcome there and then; the credit runs afterwards without the lock.
//! A second attempt on a claimed wager fails with `AlreadySettled`, so a wager
//! is credited at most once no matter how the auto cash-out tick and manual
//! requests interleave. The round clock only ever waits on the lock, never on
//! the account store.
//!
//! ## Settlement rules
//!
//! | Path            | Multiplier            | Payout credited            |
//! |-----------------|-----------------------|----------------------------|
//! | Auto cash-out   | the wager's target    | `stake * target`           |
//! | Manual cash-out | observed (≤ live)     | `stake * observed`         |
//! | Forced loss     | none                  | nothing (stake already out)|

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::amount::{Amount, Multiplier};
use crate::game::state::{RoundId, RoundPhase};
use crate::store::{AccountId, AccountStore, StoreError};

/// Wager identifier.
pub type WagerId = Uuid;

/// Credit attempts for a payout whose round has already crashed.
pub const PAYOUT_ATTEMPTS: u32 = 3;

/// Pause between those attempts.
pub const PAYOUT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Wager lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerStatus {
    /// In play.
    Pending,
    /// Cashed out.
    Won,
    /// Still in at crash.
    Lost,
}

/// How a winning wager was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashOutKind {
    /// Target reached on a clock tick.
    Auto,
    /// Player request.
    Manual,
}

/// A bet on one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wager {
    /// Wager identifier.
    pub id: WagerId,
    /// Owning account.
    pub account: AccountId,
    /// Round the wager belongs to.
    pub round_id: RoundId,
    /// Stake debited at placement.
    pub stake: Amount,
    /// Auto cash-out target, if any.
    pub auto_cash_out: Option<Multiplier>,
    /// Lifecycle status.
    pub status: WagerStatus,
    /// Multiplier the wager settled at (won only).
    pub settled_multiplier: Option<Multiplier>,
    /// Signed result in hundredths: amount credited on a win, `-stake` on a loss.
    pub profit: i64,
}

impl Wager {
    fn new(account: AccountId, round_id: RoundId, stake: Amount, auto_cash_out: Option<Multiplier>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account,
            round_id,
            stake,
            auto_cash_out,
            status: WagerStatus::Pending,
            settled_multiplier: None,
            profit: 0,
        }
    }

    /// Amount credited if the wager cashes out at `multiplier`.
    pub fn payout_at(&self, multiplier: Multiplier) -> Amount {
        self.stake.times(multiplier)
    }

    fn settle_won(&mut self, multiplier: Multiplier, payout: Amount) {
        self.status = WagerStatus::Won;
        self.settled_multiplier = Some(multiplier);
        self.profit = payout.as_signed();
    }

    fn reopen(&mut self) {
        self.status = WagerStatus::Pending;
        self.settled_multiplier = None;
        self.profit = 0;
    }

    fn settle_lost(&mut self) {
        self.status = WagerStatus::Lost;
        self.settled_multiplier = None;
        self.profit = -self.stake.as_signed();
    }

    /// True once won or lost.
    pub fn is_settled(&self) -> bool {
        self.status != WagerStatus::Pending
    }
}

/// Settlement errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    /// Action not allowed in the current round phase.
    #[error("not allowed while round is {0:?}")]
    InvalidPhase(RoundPhase),
    /// Stake below the minimum.
    #[error("stake {stake} below minimum {minimum}")]
    InvalidStake {
        /// Requested stake.
        stake: Amount,
        /// Configured minimum.
        minimum: Amount,
    },
    /// Auto cash-out target below the minimum.
    #[error("auto cash-out target {target} below minimum {minimum}")]
    InvalidTarget {
        /// Requested target.
        target: Multiplier,
        /// Configured minimum.
        minimum: Multiplier,
    },
    /// Debit refused.
    #[error("insufficient balance: have {balance}, need {requested}")]
    InsufficientBalance {
        /// Balance at the time of the attempt.
        balance: Amount,
        /// Requested stake.
        requested: Amount,
    },
    /// No such wager in the current round for this account.
    #[error("wager not found")]
    WagerNotFound,
    /// Wager already settled or being settled.
    #[error("wager already settled")]
    AlreadySettled,
    /// Account store failed or timed out.
    #[error("account store unavailable: {0}")]
    AccountStoreUnavailable(String),
}

impl From<StoreError> for SettlementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientBalance { balance, requested } => {
                SettlementError::InsufficientBalance { balance, requested }
            }
            StoreError::Unavailable(reason) => SettlementError::AccountStoreUnavailable(reason),
        }
    }
}

/// Stake and target limits.
#[derive(Debug, Clone, Copy)]
pub struct BettingLimits {
    /// Smallest stake.
    pub min_stake: Amount,
    /// Smallest auto cash-out target.
    pub min_auto_cash_out: Multiplier,
}

impl BettingLimits {
    /// Validate a bet request. The only place targets are checked.
    pub fn validate(&self, stake: Amount, target: Option<Multiplier>) -> Result<(), SettlementError> {
        if stake < self.min_stake {
            return Err(SettlementError::InvalidStake { stake, minimum: self.min_stake });
        }
        if let Some(target) = target {
            if target < self.min_auto_cash_out {
                return Err(SettlementError::InvalidTarget {
                    target,
                    minimum: self.min_auto_cash_out,
                });
            }
        }
        Ok(())
    }
}

impl From<&EngineConfig> for BettingLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            min_stake: config.min_stake,
            min_auto_cash_out: config.min_auto_cash_out,
        }
    }
}

/// Result of a successful placement.
#[derive(Debug, Clone)]
pub struct PlacedBet {
    /// The new pending wager.
    pub wager: Wager,
    /// Balance after the debit.
    pub balance: Amount,
}

/// Result of a successful cash-out.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// The settled wager.
    pub wager: Wager,
    /// Amount credited.
    pub payout: Amount,
    /// Balance after the credit.
    pub balance: Amount,
    /// Settlement path.
    pub kind: CashOutKind,
}

/// A won wager awaiting its credit.
#[derive(Debug, Clone)]
pub struct PayoutClaim {
    /// The wager, already marked won.
    pub wager: Wager,
    /// Amount to credit.
    pub payout: Amount,
    /// Settlement path.
    pub kind: CashOutKind,
}

/// Result of the forced-loss sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Round swept.
    pub round_id: RoundId,
    /// Wagers settled lost by this sweep.
    pub lost: Vec<Wager>,
    /// Won wagers whose credit was still in flight.
    pub in_flight: usize,
}

/// Wager book for the current round.
#[derive(Debug)]
struct Ledger {
    round_id: RoundId,
    phase: RoundPhase,
    /// Highest multiplier the clock has reported this round.
    live_multiplier: f64,
    wagers: BTreeMap<WagerId, Wager>,
    /// Won wagers with a credit in flight.
    claims: BTreeSet<WagerId>,
}

impl Ledger {
    fn new() -> Self {
        Self {
            round_id: 0,
            phase: RoundPhase::Waiting,
            live_multiplier: 1.0,
            wagers: BTreeMap::new(),
            claims: BTreeSet::new(),
        }
    }

    fn is_current(&self, wager: &Wager) -> bool {
        wager.round_id == self.round_id
    }
}

/// Validates and applies bets and cash-outs against the account store.
pub struct SettlementCoordinator {
    ledger: Mutex<Ledger>,
    store: Arc<dyn AccountStore>,
    limits: BettingLimits,
    store_timeout: Duration,
}

impl SettlementCoordinator {
    /// Create a coordinator.
    pub fn new(store: Arc<dyn AccountStore>, limits: BettingLimits, store_timeout: Duration) -> Self {
        Self {
            ledger: Mutex::new(Ledger::new()),
            store,
            limits,
            store_timeout,
        }
    }

    /// Create from engine configuration.
    pub fn from_config(store: Arc<dyn AccountStore>, config: &EngineConfig) -> Self {
        Self::new(store, BettingLimits::from(config), config.store_timeout)
    }

    // =========================================================================
    // ENGINE-DRIVEN TRANSITIONS
    // =========================================================================

    /// Open betting for a newly committed round.
    pub async fn open_round(&self, round_id: RoundId) {
        let mut ledger = self.ledger.lock().await;
        ledger.round_id = round_id;
        ledger.phase = RoundPhase::Countdown;
        ledger.live_multiplier = 1.0;

        // Keep only wagers whose credit is still in flight.
        let claims = std::mem::take(&mut ledger.claims);
        ledger.wagers.retain(|id, _| claims.contains(id));
        ledger.claims = claims;
    }

    /// Close betting; cash-outs allowed from now on.
    pub async fn begin_running(&self) {
        let mut ledger = self.ledger.lock().await;
        ledger.phase = RoundPhase::Running;
        ledger.live_multiplier = 1.0;
    }

    /// Claim every pending auto cash-out whose target is at or below `multiplier`.
    ///
    /// Claimed wagers are won at their target, not at `multiplier`. Only the
    /// ledger is touched; credit each claim with [`Self::pay_out`].
    pub async fn auto_cash_out_check(&self, multiplier: f64) -> Vec<PayoutClaim> {
        let mut ledger = self.ledger.lock().await;
        if ledger.phase != RoundPhase::Running {
            return Vec::new();
        }
        if multiplier > ledger.live_multiplier {
            ledger.live_multiplier = multiplier;
        }

        let round_id = ledger.round_id;
        let Ledger { wagers, claims, .. } = &mut *ledger;

        let mut due = Vec::new();
        for wager in wagers.values_mut() {
            if wager.round_id != round_id || wager.status != WagerStatus::Pending {
                continue;
            }
            let Some(target) = wager.auto_cash_out else {
                continue;
            };
            if target.as_f64() > multiplier {
                continue;
            }

            let payout = wager.payout_at(target);
            wager.settle_won(target, payout);
            claims.insert(wager.id);
            due.push(PayoutClaim {
                wager: wager.clone(),
                payout,
                kind: CashOutKind::Auto,
            });
        }

        due
    }

    /// Credit a claimed payout.
    ///
    /// A failed credit while the round is still running reopens the wager.
    /// Once the round has crashed the win stands and the credit is retried a
    /// bounded number of times.
    pub async fn pay_out(&self, claim: PayoutClaim) -> Result<Settlement, SettlementError> {
        let PayoutClaim { wager, payout, kind } = claim;
        let mut attempt = 1;

        loop {
            let credit = self.guarded(self.store.credit(wager.account, payout)).await;

            let mut ledger = self.ledger.lock().await;
            let open = ledger.phase == RoundPhase::Running && ledger.round_id == wager.round_id;

            let error = match credit {
                Ok(balance) => {
                    ledger.claims.remove(&wager.id);
                    info!(
                        "{:?} cash-out {} for {} at {}x, paid {}",
                        kind,
                        wager.id,
                        wager.account.short(),
                        wager.settled_multiplier.unwrap_or_default(),
                        payout
                    );
                    return Ok(Settlement { wager, payout, balance, kind });
                }
                Err(e) => e,
            };

            if open {
                ledger.claims.remove(&wager.id);
                if let Some(entry) = ledger.wagers.get_mut(&wager.id) {
                    entry.reopen();
                }
                warn!("{:?} cash-out {} for {} failed: {}", kind, wager.id, wager.account.short(), error);
                return Err(error.into());
            }

            if attempt >= PAYOUT_ATTEMPTS {
                ledger.claims.remove(&wager.id);
                error!(
                    "Payout {} of {} to {} still owed after {} attempts: {}",
                    wager.id,
                    payout,
                    wager.account,
                    attempt,
                    error
                );
                return Err(error.into());
            }

            drop(ledger);
            warn!("Payout {} failed after crash (attempt {}): {}", wager.id, attempt, error);
            attempt += 1;
            tokio::time::sleep(PAYOUT_RETRY_DELAY).await;
        }
    }

    /// Settle every remaining pending wager of the round as lost.
    ///
    /// Claimed wagers are already won, so nothing is left pending afterwards.
    pub async fn forced_loss_sweep(&self) -> SweepReport {
        let mut ledger = self.ledger.lock().await;
        ledger.phase = RoundPhase::Crashed;

        let round_id = ledger.round_id;
        let Ledger { wagers, claims, .. } = &mut *ledger;

        let mut report = SweepReport {
            round_id,
            ..Default::default()
        };

        for wager in wagers.values_mut() {
            if wager.round_id != round_id {
                continue;
            }
            if claims.contains(&wager.id) {
                report.in_flight += 1;
            }
            if wager.status == WagerStatus::Pending {
                wager.settle_lost();
                report.lost.push(wager.clone());
            }
        }

        debug!(
            "Round {} sweep: {} lost, {} payouts in flight",
            round_id,
            report.lost.len(),
            report.in_flight
        );
        report
    }

    // =========================================================================
    // PLAYER REQUESTS
    // =========================================================================

    /// Place a bet on the round in countdown.
    pub async fn place_bet(
        &self,
        account: AccountId,
        stake: Amount,
        auto_cash_out: Option<Multiplier>,
    ) -> Result<PlacedBet, SettlementError> {
        self.limits.validate(stake, auto_cash_out)?;

        let round_id = {
            let ledger = self.ledger.lock().await;
            if ledger.phase != RoundPhase::Countdown {
                return Err(SettlementError::InvalidPhase(ledger.phase));
            }
            ledger.round_id
        };

        let balance = self.guarded(self.store.debit(account, stake)).await?;

        let mut ledger = self.ledger.lock().await;
        if ledger.phase != RoundPhase::Countdown || ledger.round_id != round_id {
            // Window closed while the debit was in flight.
            let phase = ledger.phase;
            drop(ledger);
            self.refund(account, stake).await;
            return Err(SettlementError::InvalidPhase(phase));
        }

        let wager = Wager::new(account, round_id, stake, auto_cash_out);
        ledger.wagers.insert(wager.id, wager.clone());

        info!(
            "Bet {} placed by {} on round {}: stake {}, auto {:?}",
            wager.id,
            account.short(),
            round_id,
            stake,
            auto_cash_out.map(|m| m.to_string())
        );

        Ok(PlacedBet { wager, balance })
    }

    /// Cash out a pending wager at `observed`.
    ///
    /// The settled multiplier never exceeds what the clock has reported.
    pub async fn manual_cash_out(
        &self,
        account: AccountId,
        wager_id: WagerId,
        observed: Multiplier,
    ) -> Result<Settlement, SettlementError> {
        let claim = {
            let mut ledger = self.ledger.lock().await;
            if ledger.phase != RoundPhase::Running {
                return Err(SettlementError::InvalidPhase(ledger.phase));
            }

            let reached = Multiplier::from_f64_floor(ledger.live_multiplier);
            let round_id = ledger.round_id;
            let wager = ledger
                .wagers
                .get_mut(&wager_id)
                .filter(|w| w.account == account && w.round_id == round_id)
                .ok_or(SettlementError::WagerNotFound)?;

            if wager.is_settled() {
                return Err(SettlementError::AlreadySettled);
            }

            let multiplier = observed.min(reached).max(Multiplier::ONE);
            let payout = wager.payout_at(multiplier);
            wager.settle_won(multiplier, payout);
            let wager = wager.clone();
            ledger.claims.insert(wager_id);

            PayoutClaim {
                wager,
                payout,
                kind: CashOutKind::Manual,
            }
        };

        self.pay_out(claim).await
    }

    /// Current balance of an account.
    pub async fn balance(&self, account: AccountId) -> Result<Amount, SettlementError> {
        Ok(self.guarded(self.store.balance(account)).await?)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Look up a wager still held by the ledger.
    pub async fn wager(&self, wager_id: &WagerId) -> Option<Wager> {
        self.ledger.lock().await.wagers.get(wager_id).cloned()
    }

    /// Wagers of the current round.
    pub async fn round_wagers(&self) -> Vec<Wager> {
        let ledger = self.ledger.lock().await;
        ledger
            .wagers
            .values()
            .filter(|w| ledger.is_current(w))
            .cloned()
            .collect()
    }

    // =========================================================================
    // STORE ACCESS
    // =========================================================================

    async fn guarded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "timed out after {}ms",
                self.store_timeout.as_millis()
            ))),
        }
    }

    async fn refund(&self, account: AccountId, stake: Amount) {
        if let Err(e) = self.guarded(self.store.credit(account, stake)).await {
            error!("Refund of {} to {} failed: {}", stake, account, e);
        }
    }
}
