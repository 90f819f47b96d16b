//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every frame
//! is a JSON object tagged by event name (`{"type": "queue-join", ...}`);
//! payload fields are camelCase. Parsing happens once at the transport
//! boundary — a frame that does not parse is answered with an `error` event
//! and the connection is kept.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::command::{Command, Tick};
use crate::engine::history::TickBatch;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Connection handshake. Required first message when auth is enabled.
    #[serde(rename_all = "camelCase")]
    Hello {
        /// Bearer token for the configured validator.
        #[serde(default)]
        auth_token: Option<String>,
        /// Client-supplied identity, trusted only for anonymous access.
        #[serde(default)]
        player_id: Option<String>,
        /// Display name.
        #[serde(default)]
        username: Option<String>,
    },

    /// Enter the matchmaking queue.
    #[serde(rename_all = "camelCase")]
    QueueJoin {
        /// Player identity (ignored when the connection is authenticated).
        player_id: String,
        /// Display name.
        username: String,
    },

    /// Leave the matchmaking queue.
    #[serde(rename_all = "camelCase")]
    QueueLeave {
        /// Player identity (ignored when the connection is authenticated).
        player_id: String,
    },

    /// Commands for a future tick. The server stamps the authoritative
    /// player id on every entry.
    #[serde(rename_all = "camelCase")]
    SubmitCommands {
        /// Target tick.
        tick: Tick,
        /// Intent list; empty is a valid "no intent" signal.
        #[serde(default)]
        commands: Vec<Command>,
    },

    /// Rejoin a running match from a fresh connection.
    #[serde(rename_all = "camelCase")]
    ReconnectMatch {
        /// Slot owner.
        player_id: String,
        /// Match to rejoin.
        match_id: String,
    },

    /// Simulation state digest for desync detection.
    #[serde(rename_all = "camelCase")]
    StateHash {
        /// Hashed tick.
        tick: Tick,
        /// Digest string (format is the client's business).
        hash: String,
    },

    /// Heartbeat; refreshes activity like any other event.
    #[serde(rename_all = "camelCase")]
    Ping {
        /// Echoed back in `pong`.
        #[serde(default)]
        timestamp: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Handshake accepted.
    #[serde(rename_all = "camelCase")]
    Welcome {
        /// Authenticated (or trusted) identity for this connection.
        player_id: String,
        /// Server version string.
        server_version: String,
    },

    /// Handshake rejected; the connection closes after this frame.
    #[serde(rename_all = "camelCase")]
    AuthError {
        /// Human-readable failure reason.
        message: String,
    },

    /// Queue position snapshot for a joiner.
    #[serde(rename_all = "camelCase")]
    QueueStatus {
        /// 1-based position.
        position: usize,
        /// Total queued players.
        queue_size: usize,
    },

    /// A match was formed around this player.
    #[serde(rename_all = "camelCase")]
    MatchFound {
        /// Match identifier.
        match_id: String,
        /// The recipient's identity.
        player_id: String,
        /// The recipient's team.
        team_id: u32,
        /// Same-team players, excluding the recipient.
        teammates: Vec<PlayerBrief>,
        /// Other-team players.
        opponents: Vec<PlayerBrief>,
        /// Mode preset name.
        game_mode: String,
        /// PRNG seed shared by all clients.
        seed: u32,
    },

    /// Countdown second marker, from `countdownSeconds` down to 0.
    #[serde(rename_all = "camelCase")]
    Countdown {
        /// Seconds remaining.
        seconds: u32,
    },

    /// Countdown reached zero; the tick stream starts.
    #[serde(rename_all = "camelCase")]
    GameStart {
        /// Match identifier.
        match_id: String,
        /// PRNG seed shared by all clients.
        seed: u32,
        /// Ticks per second.
        tick_rate: u32,
        /// Every slot in the match.
        players: Vec<PlayerSlotInfo>,
        /// The recipient's team.
        your_team_id: u32,
    },

    /// Per-tick clock signal, emitted after the batch.
    #[serde(rename_all = "camelCase")]
    TickSync {
        /// Broadcast tick.
        tick: Tick,
        /// Server wall-clock milliseconds.
        server_time_ms: i64,
    },

    /// Authoritative command batch for one tick.
    #[serde(rename_all = "camelCase")]
    CommandsBatch {
        /// Broadcast tick.
        tick: Tick,
        /// All players' commands: player ids ascending, per-player
        /// submission order preserved.
        commands: Vec<Command>,
    },

    /// A player crossed the lagging threshold.
    #[serde(rename_all = "camelCase")]
    PlayerLagging {
        /// Affected player.
        player_id: String,
        /// Observed silence.
        ms_since_last_message: u64,
    },

    /// A player crossed the hard silence threshold.
    #[serde(rename_all = "camelCase")]
    PlayerTimeout {
        /// Affected player.
        player_id: String,
        /// Observed silence.
        ms_since_last_message: u64,
    },

    /// A player's transport dropped; their slot is retained.
    #[serde(rename_all = "camelCase")]
    PlayerDisconnected {
        /// Affected player.
        player_id: String,
        /// Their match.
        match_id: String,
    },

    /// A player rejoined.
    #[serde(rename_all = "camelCase")]
    PlayerReconnected {
        /// Affected player.
        player_id: String,
        /// Their match.
        match_id: String,
    },

    /// Reconnect verdict; exactly one per request.
    #[serde(rename_all = "camelCase")]
    ReconnectStatus {
        /// Whether the rejoin was accepted.
        success: bool,
        /// Failure reason when not.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Catch-up state for an accepted reconnect.
    #[serde(rename_all = "camelCase")]
    ReconnectState {
        /// Match identifier.
        match_id: String,
        /// Tick at the time of rejoin.
        current_tick: Tick,
        /// PRNG seed shared by all clients.
        seed: u32,
        /// player id → team id.
        team_assignment: BTreeMap<String, u32>,
        /// Entire retained broadcast window, tick-ascending.
        tick_commands_history: Vec<TickBatch>,
    },

    /// Terminal match notification; exactly one per live recipient.
    #[serde(rename_all = "camelCase")]
    MatchEnd {
        /// Match identifier.
        match_id: String,
        /// `completed`, `all-disconnected`, `server-shutdown`,
        /// `internal-error`.
        reason: String,
    },

    /// Clients disagree on simulation state.
    #[serde(rename_all = "camelCase")]
    DesyncDetected {
        /// Disputed tick.
        tick: Tick,
        /// Every submitted digest, by player.
        hashes: BTreeMap<String, String>,
    },

    /// Acknowledgment for every `submit-commands`.
    #[serde(rename_all = "camelCase")]
    SubmitCommandsAck {
        /// Echoed target tick.
        tick: Tick,
        /// Whether the submission was stored.
        accepted: bool,
        /// Rejection reason when not.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Queue policy violation.
    #[serde(rename_all = "camelCase")]
    QueueError {
        /// Human-readable reason.
        message: String,
    },

    /// Protocol-level error; the connection is kept.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },

    /// Heartbeat reply.
    #[serde(rename_all = "camelCase")]
    Pong {
        /// Client timestamp echoed back.
        timestamp: u64,
        /// Server wall-clock milliseconds.
        server_time_ms: i64,
    },
}

/// Player identity as shown to other players.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerBrief {
    /// Stable identifier.
    pub player_id: String,
    /// Display name.
    pub username: String,
}

/// Full slot listing for `game-start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSlotInfo {
    /// Stable identifier.
    pub player_id: String,
    /// Display name.
    pub username: String,
    /// Team assignment.
    pub team_id: u32,
}

/// Error codes for the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Frame did not parse against the protocol.
    InvalidMessage,
    /// Operation requires an authenticated connection.
    NotAuthenticated,
    /// Operation requires match membership.
    NotInMatch,
    /// Unexpected server-side failure.
    InternalError,
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
}
