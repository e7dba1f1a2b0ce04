//! Network Layer
//!
//! WebSocket server, wire protocol and event fanout.
//! Round logic runs in `game/`; this layer only carries requests in and
//! events out.

pub mod auth;
pub mod protocol;
pub mod broadcast;
pub mod server;

pub use auth::{AuthConfig, AuthError, Identity, TokenClaims, authenticate};
pub use protocol::{ClientMessage, ServerMessage, ErrorCode, TickFrame};
pub use broadcast::{BroadcastFanout, Frame};
pub use server::{CrashServer, CrashServerError, ServerConfig};
