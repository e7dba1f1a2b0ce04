//! Broadcast Fanout
//!
//! Delivers engine events to connected clients by audience. Each event is
//! rendered once per encoding and the shared frame is handed to every
//! matching subscriber with `try_send`, so a slow client can never stall the
//! round loop. A subscriber whose buffer is full is evicted: it is dropped
//! from the registry and told to disconnect, rather than silently missing
//! events.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tracing::{error, warn};

use crate::core::amount::round_for_display;
use crate::game::events::{Audience, EventSink, RoundEvent};
use crate::network::protocol::{
    crash_point_label, history_labels, BalanceUpdated, ServerMessage, TickFrame,
};
use crate::store::AccountId;

/// Outbound frame shared between subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON text.
    Text(Arc<str>),
    /// Binary payload.
    Binary(Arc<[u8]>),
}

impl Frame {
    /// Render a message as a text frame.
    pub fn message(msg: &ServerMessage) -> Option<Frame> {
        match msg.to_json() {
            Ok(text) => Some(Frame::Text(text.into())),
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                None
            }
        }
    }
}

/// One registered connection.
struct Subscriber {
    tx: mpsc::Sender<Frame>,
    kick: Arc<Notify>,
    account: Option<AccountId>,
    privileged: bool,
    binary_ticks: bool,
}

impl Subscriber {
    fn wants(&self, audience: Audience) -> bool {
        match audience {
            Audience::Public => true,
            Audience::Privileged => self.privileged,
            Audience::Account(account) => self.account == Some(account),
        }
    }
}

/// A rendered event.
struct Rendered {
    text: Option<Frame>,
    binary: Option<Frame>,
}

impl Rendered {
    fn for_subscriber(&self, subscriber: &Subscriber) -> Option<Frame> {
        if subscriber.binary_ticks {
            if let Some(binary) = &self.binary {
                return Some(binary.clone());
            }
        }
        self.text.clone()
    }
}

/// Audience-aware event fanout.
#[derive(Default)]
pub struct BroadcastFanout {
    subscribers: RwLock<BTreeMap<SocketAddr, Subscriber>>,
}

impl BroadcastFanout {
    /// Create an empty fanout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection on the public audience.
    ///
    /// The returned notifier fires if the subscriber is evicted.
    pub fn subscribe(&self, addr: SocketAddr, tx: mpsc::Sender<Frame>) -> Arc<Notify> {
        let kick = Arc::new(Notify::new());
        let subscriber = Subscriber {
            tx,
            kick: kick.clone(),
            account: None,
            privileged: false,
            binary_ticks: false,
        };
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.insert(addr, subscriber);
        }
        kick
    }

    /// Remove a connection.
    pub fn unsubscribe(&self, addr: &SocketAddr) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.remove(addr);
        }
    }

    /// Remove a connection and tell it to disconnect.
    pub fn evict(&self, addr: &SocketAddr) {
        let removed = self
            .subscribers
            .write()
            .ok()
            .and_then(|mut subscribers| subscribers.remove(addr));
        if let Some(subscriber) = removed {
            subscriber.kick.notify_one();
        }
    }

    /// Bind a connection to an account for balance pushes.
    pub fn set_account(&self, addr: &SocketAddr, account: AccountId) {
        self.update(addr, |s| s.account = Some(account));
    }

    /// Add or remove a connection from the privileged audience.
    pub fn set_privileged(&self, addr: &SocketAddr, privileged: bool) {
        self.update(addr, |s| s.privileged = privileged);
    }

    /// Choose binary or JSON multiplier ticks.
    pub fn set_binary_ticks(&self, addr: &SocketAddr, enabled: bool) {
        self.update(addr, |s| s.binary_ticks = enabled);
    }

    /// Number of registered connections.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of privileged connections.
    pub fn privileged_count(&self) -> usize {
        self.subscribers
            .read()
            .map(|s| s.values().filter(|sub| sub.privileged).count())
            .unwrap_or(0)
    }

    fn update(&self, addr: &SocketAddr, apply: impl FnOnce(&mut Subscriber)) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            if let Some(subscriber) = subscribers.get_mut(addr) {
                apply(subscriber);
            }
        }
    }

    /// Deliver a rendered event; returns subscribers to evict.
    fn deliver(&self, audience: Audience, rendered: &Rendered) -> Vec<SocketAddr> {
        let Ok(subscribers) = self.subscribers.read() else {
            return Vec::new();
        };

        let mut dead = Vec::new();
        for (addr, subscriber) in subscribers.iter() {
            if !subscriber.wants(audience) {
                continue;
            }
            let Some(frame) = rendered.for_subscriber(subscriber) else {
                continue;
            };
            match subscriber.tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Evicting slow subscriber {}", addr);
                    dead.push(*addr);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*addr),
            }
        }
        dead
    }
}

impl EventSink for BroadcastFanout {
    fn publish(&self, event: RoundEvent) {
        let audience = event.audience();
        let rendered = render(&event);
        for addr in self.deliver(audience, &rendered) {
            self.evict(&addr);
        }
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Wire message for an event.
pub fn to_message(event: &RoundEvent) -> ServerMessage {
    match event {
        RoundEvent::Countdown { round_id, remaining } => ServerMessage::Countdown {
            round_id: *round_id,
            seconds: (remaining.as_secs_f64() * 10.0).round() / 10.0,
        },
        RoundEvent::UpcomingPreview { round_id, upcoming } => ServerMessage::UpcomingCrashPoints {
            round_id: *round_id,
            upcoming: upcoming.iter().map(|m| crash_point_label(*m)).collect(),
            timestamp: Utc::now(),
        },
        RoundEvent::RoundStarted { round_id } => ServerMessage::RoundStarted { round_id: *round_id },
        RoundEvent::MultiplierTick { round_id, multiplier, elapsed } => ServerMessage::MultiplierUpdate {
            round_id: *round_id,
            multiplier: round_for_display(*multiplier),
            elapsed: elapsed.as_secs_f64(),
        },
        RoundEvent::RoundEnded { round_id, crash_point, history } => ServerMessage::RoundEnded {
            round_id: *round_id,
            crash_point: crash_point_label(*crash_point),
            history: history_labels(history),
        },
        RoundEvent::BalanceUpdated { wager_id, multiplier, payout, balance, .. } => {
            ServerMessage::BalanceUpdated(BalanceUpdated {
                wager_id: *wager_id,
                multiplier: multiplier.as_f64(),
                payout: payout.to_float(),
                balance: balance.to_float(),
            })
        }
    }
}

fn render(event: &RoundEvent) -> Rendered {
    let binary = match event {
        RoundEvent::MultiplierTick { round_id, multiplier, elapsed } => {
            let frame = TickFrame {
                round_id: *round_id,
                multiplier: (round_for_display(*multiplier) * 100.0).round() as u32,
                elapsed_ms: u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX),
            };
            match frame.to_bytes() {
                Ok(bytes) => Some(Frame::Binary(bytes.into())),
                Err(e) => {
                    error!("Failed to encode tick frame: {}", e);
                    None
                }
            }
        }
        _ => None,
    };

    Rendered {
        text: Frame::message(&to_message(event)),
        binary,
    }
}
