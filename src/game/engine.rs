//! Round Engine
//!
//! The single authoritative loop. It owns the round state, the upcoming
//! queue and the crash point source, and drives every phase transition in
//! order:
//!
//! ```text
//! ensure queue ─► dequeue ─► countdown ─► running ─► sweep ─► crashed ─► delay ─┐
//!      ▲                                                                         │
//!      └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Player requests never touch this state directly; they go through the
//! [`SettlementCoordinator`], which the engine opens and closes per phase.

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::amount::Multiplier;
use crate::game::clock::{ClockReading, MultiplierClock};
use crate::game::crash_point::CrashPointSource;
use crate::game::events::{EventSink, RoundEvent};
use crate::game::settlement::SettlementCoordinator;
use crate::game::state::{RoundId, RoundPhase, RoundSnapshot, RoundState, TransitionError};
use crate::game::upcoming::{QueueError, UpcomingQueue};

/// Errors that abort a single round.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// No crash point available.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Lifecycle violated.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Read-only views published by the engine.
#[derive(Clone)]
pub struct EngineWatch {
    /// Public round view.
    pub snapshot: watch::Receiver<RoundSnapshot>,
    /// Latest privileged preview.
    pub upcoming: watch::Receiver<Vec<Multiplier>>,
}

/// The round loop.
pub struct RoundEngine {
    config: EngineConfig,
    clock: MultiplierClock,
    state: RoundState,
    queue: UpcomingQueue,
    source: Box<dyn CrashPointSource>,
    settlement: Arc<SettlementCoordinator>,
    sink: Arc<dyn EventSink>,
    snapshot_tx: watch::Sender<RoundSnapshot>,
    upcoming_tx: watch::Sender<Vec<Multiplier>>,
}

impl RoundEngine {
    /// Create an engine in `Waiting`.
    pub fn new(
        config: EngineConfig,
        source: Box<dyn CrashPointSource>,
        settlement: Arc<SettlementCoordinator>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let state = RoundState::new(config.history_len);
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        let (upcoming_tx, _) = watch::channel(Vec::new());

        Self {
            clock: MultiplierClock::new(config.growth_rate),
            config,
            state,
            queue: UpcomingQueue::new(),
            source,
            settlement,
            sink,
            snapshot_tx,
            upcoming_tx,
        }
    }

    /// Subscribe to the published views.
    pub fn watch(&self) -> EngineWatch {
        EngineWatch {
            snapshot: self.snapshot_tx.subscribe(),
            upcoming: self.upcoming_tx.subscribe(),
        }
    }

    /// Current round state.
    pub fn state(&self) -> &RoundState {
        &self.state
    }

    /// Run rounds until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Round engine started (k={}, cap={}x, countdown={:?})",
            self.config.growth_rate, self.config.max_multiplier, self.config.countdown_duration
        );

        loop {
            let outcome = tokio::select! {
                result = self.run_round() => Some(result),
                _ = shutdown.recv() => None,
            };

            match outcome {
                Some(Ok(round_id)) => debug!("Round {} complete", round_id),
                Some(Err(e)) => error!("Round aborted: {}", e),
                None => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.post_crash_delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Round engine shutting down at round {}", self.state.id);
    }

    /// Run one full round: countdown, running, crash.
    pub async fn run_round(&mut self) -> Result<RoundId, EngineError> {
        let round_id = self.countdown_phase().await?;
        self.running_phase().await?;
        self.crash_phase().await?;
        Ok(round_id)
    }

    // =========================================================================
    // PHASES
    // =========================================================================

    async fn countdown_phase(&mut self) -> Result<RoundId, EngineError> {
        self.queue.ensure(self.config.upcoming_target, self.source.as_mut());
        let crash_point = self.queue.dequeue_next()?;
        let round_id = self.state.begin_countdown(crash_point)?;

        // Top up again so the preview always shows a full look-ahead.
        self.queue.ensure(self.config.upcoming_target, self.source.as_mut());
        let upcoming = self.queue.preview(self.config.upcoming_preview_len);
        self.upcoming_tx.send_replace(upcoming.clone());

        self.settlement.open_round(round_id).await;
        self.publish_snapshot();
        self.sink.publish(RoundEvent::UpcomingPreview { round_id, upcoming });

        info!("Round {} countdown started", round_id);

        let step = self.config.countdown_step;
        let mut remaining = self.config.countdown_duration;
        while !remaining.is_zero() {
            self.sink.publish(RoundEvent::Countdown { round_id, remaining });
            tokio::time::sleep(step.min(remaining)).await;
            remaining = remaining.saturating_sub(step);
        }

        Ok(round_id)
    }

    async fn running_phase(&mut self) -> Result<(), EngineError> {
        let round_id = self.state.id;
        let crash_point = self.state.crash_point();
        let started_at = Instant::now();

        // Close betting before the clock is visible to anyone.
        self.settlement.begin_running().await;
        self.state.begin_running()?;
        self.publish_snapshot();
        self.sink.publish(RoundEvent::RoundStarted { round_id });

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let (multiplier, elapsed) = match self.clock.read(started_at, Instant::now(), crash_point) {
                ClockReading::Climbing { multiplier, elapsed } => (multiplier, elapsed),
                ClockReading::Crashed { elapsed } => {
                    debug!("Round {} reached {}x after {:?}", round_id, crash_point, elapsed);
                    break;
                }
            };

            self.state.advance_multiplier(multiplier);
            self.settle_auto(multiplier).await;

            #[cfg(feature = "debug-tracing")]
            tracing::trace!("Round {} tick {:.4}x at {:?}", round_id, multiplier, elapsed);

            self.sink.publish(RoundEvent::MultiplierTick { round_id, multiplier, elapsed });
            self.publish_snapshot();
        }

        // Targets strictly below the crash point were reached even if no
        // tick landed between target and crash.
        if crash_point > Multiplier::ONE {
            let last_below = Multiplier::from_hundredths(crash_point.hundredths() - 1);
            self.settle_auto(last_below.as_f64()).await;
        }

        Ok(())
    }

    async fn crash_phase(&mut self) -> Result<(), EngineError> {
        let round_id = self.state.id;

        // Every pending wager is terminal before the crash is announced.
        let report = self.settlement.forced_loss_sweep().await;
        if report.in_flight > 0 {
            warn!(
                "Round {} crashed with {} payouts still waiting on the account store",
                round_id, report.in_flight
            );
        }

        let crash_point = self.state.crash()?;
        self.publish_snapshot();
        self.sink.publish(RoundEvent::RoundEnded {
            round_id,
            crash_point,
            history: self.state.history().to_vec(),
        });

        info!(
            "Round {} crashed at {}x ({} wagers lost)",
            round_id,
            crash_point,
            report.lost.len()
        );
        Ok(())
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Claim due auto cash-outs; credits run off the loop.
    async fn settle_auto(&self, multiplier: f64) {
        for claim in self.settlement.auto_cash_out_check(multiplier).await {
            let settlement = self.settlement.clone();
            let sink = self.sink.clone();
            tokio::spawn(async move {
                if let Ok(settled) = settlement.pay_out(claim).await {
                    sink.publish(RoundEvent::from(&settled));
                }
            });
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.state.snapshot());
    }

    /// Phase the engine is in.
    pub fn phase(&self) -> RoundPhase {
        self.state.phase
    }

    /// Crash points still queued.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
