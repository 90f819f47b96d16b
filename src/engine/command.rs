//! Command Buffer
//!
//! Per-match storage for player commands awaiting broadcast. The buffer
//! enforces the acceptance window and the last-write-wins rule, and produces
//! the canonical flattened batch for each tick: players in ascending id
//! order, each player's commands in the order they were submitted.
//!
//! The buffer never inspects command payloads. `data` is opaque JSON carried
//! through verbatim; only `player_id` is authoritative, stamped by the
//! server on ingestion so clients cannot forge another player's id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Simulation tick number.
pub type Tick = u32;

/// A player-originated intent for one tick.
///
/// `player_id` is empty on the wire from clients and assigned by the server;
/// broadcasts always carry the authoritative value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Authoritative issuer, stamped on ingestion.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub player_id: String,
    /// Command discriminator, opaque to the engine.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload, forwarded untouched.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Command {
    /// Construct a command with no payload (tests and embedders).
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            player_id: String::new(),
            kind: kind.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// Why a submission was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandRejected {
    /// Submitter is not a member of the match.
    #[error("wrong-match")]
    WrongMatch,
    /// Tick already broadcast (tick ≤ current).
    #[error("late")]
    Late,
    /// Tick beyond the acceptance window.
    #[error("too-far-future")]
    TooFarFuture,
    /// Match is not running.
    #[error("match-ended")]
    MatchEnded,
}

impl CommandRejected {
    /// Wire reason string for the ack.
    pub fn as_reason(&self) -> &'static str {
        match self {
            CommandRejected::WrongMatch => "wrong-match",
            CommandRejected::Late => "late",
            CommandRejected::TooFarFuture => "too-far-future",
            CommandRejected::MatchEnded => "match-ended",
        }
    }
}

/// Per-tick, per-player command store.
#[derive(Debug)]
pub struct CommandBuffer {
    /// Acceptance window beyond the current tick.
    max_future_ticks: u32,
    /// tick → player id → submitted commands (last write wins).
    pending: BTreeMap<Tick, BTreeMap<String, Vec<Command>>>,
}

impl CommandBuffer {
    /// Create a buffer with the given forward acceptance window.
    pub fn new(max_future_ticks: u32) -> Self {
        Self {
            max_future_ticks,
            pending: BTreeMap::new(),
        }
    }

    /// Validate a target tick against the acceptance window.
    ///
    /// Accepts exactly `current_tick < tick ≤ current_tick + max_future_ticks`.
    pub fn check_window(&self, current_tick: Tick, tick: Tick) -> Result<(), CommandRejected> {
        if tick <= current_tick {
            return Err(CommandRejected::Late);
        }
        if tick > current_tick.saturating_add(self.max_future_ticks) {
            return Err(CommandRejected::TooFarFuture);
        }
        Ok(())
    }

    /// Store a player's commands for a tick, stamping the authoritative
    /// player id on every entry. Overwrites any earlier submission for the
    /// same `(tick, player)` pair. An empty list is a valid submission and
    /// replaces earlier commands all the same.
    pub fn insert(&mut self, tick: Tick, player_id: &str, mut commands: Vec<Command>) {
        for command in &mut commands {
            command.player_id = player_id.to_string();
        }
        self.pending
            .entry(tick)
            .or_default()
            .insert(player_id.to_string(), commands);
    }

    /// Remove everything at or below `tick` and return the flattened batch
    /// for exactly `tick`: player ids ascending, per-player submission order
    /// preserved. Entries below `tick` can only exist if a tick was skipped;
    /// they are discarded as late.
    pub fn drain(&mut self, tick: Tick) -> Vec<Command> {
        let keep = self.pending.split_off(&(tick + 1));
        let drained = std::mem::replace(&mut self.pending, keep);

        drained
            .into_iter()
            .filter(|(t, _)| *t == tick)
            .flat_map(|(_, per_player)| per_player.into_values().flatten())
            .collect()
    }

    /// Number of ticks currently holding buffered commands.
    pub fn buffered_ticks(&self) -> usize {
        self.pending.len()
    }
}
