//! Network Layer
//!
//! WebSocket transport, wire protocol, auth boundary, and the per-match
//! session/registry machinery driven by the server's loops. Everything
//! non-deterministic lives here; the ordering guarantees come from
//! `engine/`.

pub mod auth;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use auth::{AuthError, JwtValidator, TokenValidator, TokenVerdict};
pub use protocol::{ClientMessage, ErrorCode, PlayerBrief, PlayerSlotInfo, ServerMessage};
pub use server::{GameServer, GameServerError};
pub use session::{
    generate_match_id, MatchId, MatchPhase, MatchRegistry, MatchSession, PlayerSlot,
    ReconnectError, ReconnectSnapshot, TickOutcome,
};
pub use transport::{Outbox, OutboxClosed};
