//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Messages are JSON; high-frequency multiplier ticks can optionally be
//! sent as compact bincode [`TickFrame`]s.
//!
//! Money crosses the wire as decimal units (`10.5`), crash points and
//! history as two-decimal strings (`"3.50"`, `"3.50x"`).

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::core::amount::{round_for_display, Amount, Multiplier, SCALE};
use crate::game::settlement::SettlementError;
use crate::game::state::{RoundId, RoundPhase, RoundSnapshot};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with a JWT.
    Auth {
        /// Bearer token from the identity provider.
        token: String,
    },

    /// Bet on the round in countdown.
    PlaceBet {
        /// Stake in decimal units.
        stake: f64,
        /// Optional auto cash-out target (e.g. `2.0`).
        #[serde(default)]
        auto_cash_out: Option<f64>,
    },

    /// Cash out a pending wager at the live multiplier.
    CashOut {
        /// Wager to settle.
        wager_id: Uuid,
    },

    /// Request the account balance.
    GetBalance,

    /// Request the current round view (for late joiners).
    SyncRequest,

    /// Join the privileged audience (admin tokens only).
    WatchPrivileged,

    /// Switch multiplier ticks between JSON and binary frames.
    BinaryTicks {
        /// True for bincode [`TickFrame`]s.
        enabled: bool,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client clock, echoed back.
        timestamp: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Betting window countdown.
    Countdown {
        /// Round in countdown.
        round_id: RoundId,
        /// Seconds left, one decimal.
        seconds: f64,
    },

    /// Round began. Deliberately carries no crash point.
    RoundStarted {
        /// Round now running.
        round_id: RoundId,
    },

    /// Live multiplier.
    MultiplierUpdate {
        /// Running round.
        round_id: RoundId,
        /// Two-decimal display value.
        multiplier: f64,
        /// Seconds since start.
        elapsed: f64,
    },

    /// Round crashed.
    RoundEnded {
        /// Crashed round.
        round_id: RoundId,
        /// Revealed crash point, e.g. `"3.50"`.
        crash_point: String,
        /// Newest first, e.g. `["3.50x", "1.20x"]`.
        history: Vec<String>,
    },

    /// Privileged preview of queued crash points.
    UpcomingCrashPoints {
        /// Round in countdown; its own crash point is not in the list.
        round_id: RoundId,
        /// Next crash points in play order, e.g. `"1.50"`.
        upcoming: Vec<String>,
        /// When the preview was taken.
        timestamp: DateTime<Utc>,
    },

    /// Bet accepted.
    BetPlaced(BetPlaced),

    /// Manual cash-out accepted.
    CashedOut(CashedOut),

    /// Balance reply.
    Balance {
        /// Current balance in decimal units.
        balance: f64,
    },

    /// Pushed after an automatic cash-out credits this account.
    BalanceUpdated(BalanceUpdated),

    /// Current round view.
    Sync(SyncState),

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server clock, ms since the epoch.
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Human-readable reason.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Account reference (hex) if successful.
    pub account: Option<String>,
    /// May join the privileged audience.
    #[serde(default)]
    pub privileged: bool,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Bet placement reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetPlaced {
    /// New wager.
    pub wager_id: Uuid,
    /// Round the wager belongs to.
    pub round_id: RoundId,
    /// Stake debited.
    pub stake: f64,
    /// Auto cash-out target, if set.
    pub auto_cash_out: Option<f64>,
    /// Balance after the debit.
    pub balance: f64,
}

/// Manual cash-out reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashedOut {
    /// Settled wager.
    pub wager_id: Uuid,
    /// Multiplier the wager settled at.
    pub multiplier: f64,
    /// Amount credited.
    pub payout: f64,
    /// Balance after the credit.
    pub balance: f64,
}

/// Auto cash-out push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdated {
    /// Settled wager.
    pub wager_id: Uuid,
    /// The wager's target.
    pub multiplier: f64,
    /// Amount credited.
    pub payout: f64,
    /// Balance after the credit.
    pub balance: f64,
}

/// Round view for late joiners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// Current round.
    pub round_id: RoundId,
    /// Its phase.
    pub phase: RoundPhase,
    /// Live multiplier while running, final once crashed.
    pub multiplier: Option<f64>,
    /// Newest first.
    pub history: Vec<String>,
}

impl From<&RoundSnapshot> for SyncState {
    fn from(snapshot: &RoundSnapshot) -> Self {
        Self {
            round_id: snapshot.round_id,
            phase: snapshot.phase,
            multiplier: snapshot.multiplier.map(round_for_display),
            history: history_labels(&snapshot.history),
        }
    }
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error reply.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Token lacks the required role.
    Forbidden,
    /// Invalid input.
    InvalidInput,
    /// Action not allowed in this round phase.
    InvalidPhase,
    /// Stake below minimum.
    InvalidStake,
    /// Auto cash-out target below minimum.
    InvalidTarget,
    /// Not enough balance for the stake.
    InsufficientBalance,
    /// Unknown wager.
    WagerNotFound,
    /// Wager already settled.
    AlreadySettled,
    /// Account store failed; retry later.
    StoreUnavailable,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl From<&SettlementError> for ServerError {
    fn from(err: &SettlementError) -> Self {
        let code = match err {
            SettlementError::InvalidPhase(_) => ErrorCode::InvalidPhase,
            SettlementError::InvalidStake { .. } => ErrorCode::InvalidStake,
            SettlementError::InvalidTarget { .. } => ErrorCode::InvalidTarget,
            SettlementError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            SettlementError::WagerNotFound => ErrorCode::WagerNotFound,
            SettlementError::AlreadySettled => ErrorCode::AlreadySettled,
            SettlementError::AccountStoreUnavailable(_) => ErrorCode::StoreUnavailable,
        };
        ServerError::new(code, err.to_string())
    }
}

// =============================================================================
// BINARY TICKS
// =============================================================================

/// Compact multiplier tick for binary subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickFrame {
    /// Running round.
    pub round_id: RoundId,
    /// Multiplier in hundredths (rounded).
    pub multiplier: u32,
    /// Milliseconds since start.
    pub elapsed_ms: u32,
}

impl TickFrame {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// =============================================================================
// WIRE CONVERSIONS
// =============================================================================

/// Decimal units from the wire to an exact amount (rounded to the hundredth).
pub fn amount_from_wire(units: f64) -> Option<Amount> {
    if !units.is_finite() || units < 0.0 || units > (u64::MAX / SCALE) as f64 {
        return None;
    }
    Some(Amount::from_hundredths((units * SCALE as f64).round() as u64))
}

/// Multiplier from the wire (rounded to the hundredth).
pub fn multiplier_from_wire(value: f64) -> Option<Multiplier> {
    if !value.is_finite() || value <= 0.0 || value > (u32::MAX / SCALE as u32) as f64 {
        return None;
    }
    Some(Multiplier::from_f64_rounded(value))
}

/// Crash point label, e.g. `"3.50"`.
pub fn crash_point_label(point: Multiplier) -> String {
    point.to_string()
}

/// History labels, e.g. `["3.50x", "1.20x"]`.
pub fn history_labels(history: &[Multiplier]) -> Vec<String> {
    history.iter().map(|m| format!("{}x", m)).collect()
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error reply shorthand.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg = ClientMessage::from_json(r#"{"type":"place_bet","stake":10.5,"auto_cash_out":2.0}"#).unwrap();
        match msg {
            ClientMessage::PlaceBet { stake, auto_cash_out } => {
                assert_eq!(stake, 10.5);
                assert_eq!(auto_cash_out, Some(2.0));
            }
            other => panic!("Wrong message type: {:?}", other),
        }

        // Target is optional
        let msg = ClientMessage::from_json(r#"{"type":"place_bet","stake":50}"#).unwrap();
        assert!(matches!(msg, ClientMessage::PlaceBet { auto_cash_out: None, .. }));

        let msg = ClientMessage::from_json(r#"{"type":"sync_request"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SyncRequest));
    }

    #[test]
    fn test_cash_out_parsing() {
        let id = Uuid::new_v4();
        let json = ClientMessage::CashOut { wager_id: id }.to_json().unwrap();
        assert!(json.contains("cash_out"));

        match ClientMessage::from_json(&json).unwrap() {
            ClientMessage::CashOut { wager_id } => assert_eq!(wager_id, id),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_round_started_has_no_crash_point() {
        let json = ServerMessage::RoundStarted { round_id: 9 }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"round_started","round_id":9}"#);
    }

    #[test]
    fn test_round_ended_format() {
        let msg = ServerMessage::RoundEnded {
            round_id: 3,
            crash_point: crash_point_label(Multiplier(350)),
            history: history_labels(&[Multiplier(350), Multiplier(120)]),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""crash_point":"3.50""#));
        assert!(json.contains(r#""history":["3.50x","1.20x"]"#));
    }

    #[test]
    fn test_settlement_error_codes() {
        let error = ServerError::from(&SettlementError::AlreadySettled);
        assert_eq!(error.code, ErrorCode::AlreadySettled);

        let error = ServerError::from(&SettlementError::InvalidPhase(RoundPhase::Running));
        assert_eq!(error.code, ErrorCode::InvalidPhase);

        let json = ServerMessage::Error(error).to_json().unwrap();
        assert!(json.contains("invalid_phase"));
    }

    #[test]
    fn test_wire_amounts() {
        assert_eq!(amount_from_wire(10.5), Some(Amount(1_050)));
        assert_eq!(amount_from_wire(0.004), Some(Amount(0)));
        assert_eq!(amount_from_wire(-1.0), None);
        assert_eq!(amount_from_wire(f64::NAN), None);

        assert_eq!(multiplier_from_wire(2.0), Some(Multiplier(200)));
        assert_eq!(multiplier_from_wire(f64::INFINITY), None);
        assert_eq!(multiplier_from_wire(0.0), None);
    }

    #[test]
    fn test_sync_from_snapshot() {
        let snapshot = RoundSnapshot {
            round_id: 4,
            phase: RoundPhase::Running,
            multiplier: Some(1.23456),
            history: vec![Multiplier(150)],
        };
        let sync = SyncState::from(&snapshot);
        assert_eq!(sync.multiplier, Some(1.23));
        assert_eq!(sync.history, vec!["1.50x".to_string()]);
    }

    #[test]
    fn test_binary_tick_frame() {
        // Tagged enums don't go through bincode; flat frames do.
        let frame = TickFrame { round_id: 12, multiplier: 245, elapsed_ms: 4_980 };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(TickFrame::from_bytes(&bytes).unwrap(), frame);
    }
}
