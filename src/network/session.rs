//! Match Session Management
//!
//! One [`MatchSession`] per live match: the slots, the lifecycle state, the
//! command buffer, the broadcast history, and the desync oracle, all mutated
//! under a single lock so every per-match event is serialised. The session
//! does no I/O of its own — broadcasts go through the slots' non-blocking
//! outboxes, so `run_tick` never awaits.
//!
//! [`MatchRegistry`] maps match ids and player ids to sessions and owns
//! their lifecycle, mirroring the one-registry-per-process model: sessions
//! never reference each other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{EngineConfig, GameMode};
use crate::engine::activity::{ActivityThresholds, Liveness, LivenessEvent};
use crate::engine::command::{Command, CommandBuffer, CommandRejected, Tick};
use crate::engine::desync::{DesyncOracle, DesyncReport};
use crate::engine::history::{BroadcastHistory, TickBatch};
use crate::network::protocol::{PlayerSlotInfo, ServerMessage};
use crate::network::transport::Outbox;

/// Unique match identifier, `match-<unix-millis>-<base36-random>`.
pub type MatchId = String;

/// Generate a fresh match id.
pub fn generate_match_id() -> MatchId {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("match-{}-{}", millis, to_base36(suffix))
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = [0u8; 7];
    let mut i = out.len();
    loop {
        i -= 1;
        out[i] = DIGITS[(n % 36) as usize];
        n /= 36;
        if n == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&out[i..]).into_owned()
}

/// Match lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Countdown broadcast in progress.
    Countdown,
    /// Tick loop live.
    Running,
    /// Terminal.
    Ended,
}

/// One participant's seat in a match. The slot survives disconnects for the
/// life of the match; only the outbox comes and goes with the transport.
#[derive(Debug)]
pub struct PlayerSlot {
    /// Stable player identifier.
    pub player_id: String,
    /// Display name.
    pub username: String,
    /// Team assignment.
    pub team_id: u32,
    /// Liveness state machine.
    pub liveness: Liveness,
    /// Outbound handle; `None` while unreachable.
    pub outbox: Option<Outbox>,
    /// Tick at which the player became unreachable.
    pub disconnected_at_tick: Option<Tick>,
}

impl PlayerSlot {
    /// Whether broadcasts currently reach this player.
    pub fn is_reachable(&self) -> bool {
        self.liveness.is_live() && self.outbox.is_some()
    }
}

/// Why a reconnect request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReconnectError {
    /// No such match, or it already ended.
    #[error("match not found")]
    MatchNotFound,
    /// Match reached its terminal state.
    #[error("match has ended")]
    MatchEnded,
    /// The requester owns no slot in the match.
    #[error("not a player in this match")]
    NotInMatch,
    /// The player was gone longer than the retained broadcast window.
    #[error("state too old")]
    StateTooOld,
}

/// Everything a rejoining client needs to catch up.
#[derive(Debug)]
pub struct ReconnectSnapshot {
    /// Match identifier.
    pub match_id: MatchId,
    /// Tick at the time of rejoin.
    pub current_tick: Tick,
    /// Seed forwarded at match creation.
    pub seed: u32,
    /// player id → team id.
    pub team_assignment: BTreeMap<String, u32>,
    /// Entire retained broadcast window, tick-ascending.
    pub history: Vec<TickBatch>,
}

/// Everything one scheduler firing produced, for the server's event bus and
/// lifecycle decisions. The wire traffic itself has already gone out through
/// the outboxes by the time this is returned.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// The broadcast tick.
    pub tick: Tick,
    /// Players newly reported lagging, with their silence in ms.
    pub lagging: Vec<(String, u64)>,
    /// Players newly timed out, with their silence in ms.
    pub timed_out: Vec<(String, u64)>,
    /// Players that became unreachable this tick (send failure or timeout).
    pub disconnected: Vec<String>,
    /// Desync reports compared this tick.
    pub desyncs: Vec<DesyncReport>,
    /// Whether this is the match's first desync (event-bus reporting).
    pub first_desync: bool,
    /// Every slot is unreachable; the match should end.
    pub all_disconnected: bool,
}

/// A live match: slots, lifecycle, and the per-match engine state.
pub struct MatchSession {
    /// Unique match identifier.
    pub id: MatchId,
    game_mode: GameMode,
    seed: u32,
    phase: MatchPhase,
    current_tick: Tick,
    tick_rate: u32,
    slots: Vec<PlayerSlot>,
    buffer: CommandBuffer,
    history: BroadcastHistory,
    oracle: DesyncOracle,
    thresholds: ActivityThresholds,
    created_at: Instant,
    started_at: Option<Instant>,
    end_reason: Option<String>,
    desync_reported: bool,
}

impl MatchSession {
    /// Create a session in countdown state. Teams are assigned in formation
    /// order: slot `i` joins team `i / team_size`.
    pub fn new(
        id: MatchId,
        config: &EngineConfig,
        seed: u32,
        players: Vec<(String, String, Outbox)>,
        now: Instant,
    ) -> Self {
        let team_size = config.game_mode.team_size().max(1);
        let slots = players
            .into_iter()
            .enumerate()
            .map(|(i, (player_id, username, outbox))| PlayerSlot {
                player_id,
                username,
                team_id: i as u32 / team_size,
                liveness: Liveness::new(now),
                outbox: Some(outbox),
                disconnected_at_tick: None,
            })
            .collect();

        Self {
            id,
            game_mode: config.game_mode,
            seed,
            phase: MatchPhase::Countdown,
            current_tick: 0,
            tick_rate: config.tick_rate,
            slots,
            buffer: CommandBuffer::new(config.max_future_ticks),
            history: BroadcastHistory::new(config.reconnect_history_ticks as usize),
            oracle: DesyncOracle::new(config.hash_window_ticks),
            thresholds: ActivityThresholds::from_ticks(
                config.timeout_ticks,
                config.disconnect_ticks,
                config.tick_duration_ms(),
            ),
            created_at: now,
            started_at: None,
            end_reason: None,
            desync_reported: false,
        }
    }

    /// Lifecycle state.
    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Last broadcast tick (0 before the first).
    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    /// Seed forwarded to clients.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Match composition.
    pub fn game_mode(&self) -> GameMode {
        self.game_mode
    }

    /// Ticks per second.
    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    /// Terminal reason, once ended.
    pub fn end_reason(&self) -> Option<&str> {
        self.end_reason.as_deref()
    }

    /// All slots, formation order.
    pub fn slots(&self) -> &[PlayerSlot] {
        &self.slots
    }

    /// Whether a player owns a slot.
    pub fn contains_player(&self, player_id: &str) -> bool {
        self.slots.iter().any(|s| s.player_id == player_id)
    }

    fn slot_mut(&mut self, player_id: &str) -> Option<&mut PlayerSlot> {
        self.slots.iter_mut().find(|s| s.player_id == player_id)
    }

    /// player id → team id, as sent in `reconnect-state`.
    pub fn team_assignment(&self) -> BTreeMap<String, u32> {
        self.slots
            .iter()
            .map(|s| (s.player_id.clone(), s.team_id))
            .collect()
    }

    /// Slot listing for `game-start`.
    pub fn slot_infos(&self) -> Vec<PlayerSlotInfo> {
        self.slots
            .iter()
            .map(|s| PlayerSlotInfo {
                player_id: s.player_id.clone(),
                username: s.username.clone(),
                team_id: s.team_id,
            })
            .collect()
    }

    /// Players the oracle should wait for.
    fn live_player_ids(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.liveness.is_live())
            .map(|s| s.player_id.clone())
            .collect()
    }

    /// Transition countdown → running. Liveness timestamps restart so the
    /// countdown itself never counts as silence.
    pub fn begin_running(&mut self, now: Instant) {
        if self.phase == MatchPhase::Countdown {
            self.phase = MatchPhase::Running;
            self.started_at = Some(now);
            for slot in &mut self.slots {
                if slot.liveness.is_live() {
                    slot.liveness.touch(now);
                }
            }
        }
    }

    /// Record an inbound event from a player (any event counts).
    pub fn touch_activity(&mut self, player_id: &str, now: Instant) {
        if let Some(slot) = self.slot_mut(player_id) {
            slot.liveness.touch(now);
        }
    }

    /// Accept or reject a command submission. Rules apply in order:
    /// wrong-match, late, too-far-future, match-ended.
    pub fn submit_commands(
        &mut self,
        player_id: &str,
        tick: Tick,
        commands: Vec<Command>,
    ) -> Result<(), CommandRejected> {
        if !self.contains_player(player_id) {
            return Err(CommandRejected::WrongMatch);
        }
        self.buffer.check_window(self.current_tick, tick)?;
        if self.phase != MatchPhase::Running {
            return Err(CommandRejected::MatchEnded);
        }
        self.buffer.insert(tick, player_id, commands);
        Ok(())
    }

    /// Record a state digest for desync detection.
    pub fn submit_hash(&mut self, player_id: &str, tick: Tick, hash: String) {
        if self.contains_player(player_id) {
            self.oracle.submit(tick, player_id, hash);
        }
    }

    /// Emit to a single player, if reachable.
    pub fn emit_to(&mut self, player_id: &str, message: ServerMessage) {
        let mut lost = false;
        if let Some(slot) = self.slot_mut(player_id) {
            if let Some(outbox) = &slot.outbox {
                lost = outbox.emit(message).is_err();
            }
        }
        if lost {
            self.drop_transport(player_id);
        }
    }

    /// Emit to every reachable slot. Returns the players whose connection
    /// turned out to be gone; they are marked disconnected but the send to
    /// everyone else proceeds.
    pub fn broadcast(&mut self, message: &ServerMessage) -> Vec<String> {
        let tick = self.current_tick;
        let mut dropped = Vec::new();

        for slot in &mut self.slots {
            if !slot.liveness.is_live() {
                continue;
            }
            if let Some(outbox) = &slot.outbox {
                if outbox.emit(message.clone()).is_err() {
                    slot.liveness.mark_disconnected();
                    slot.outbox = None;
                    slot.disconnected_at_tick = Some(tick);
                    dropped.push(slot.player_id.clone());
                }
            }
        }
        dropped
    }

    /// Emit to every reachable slot except one (rejoin announcements).
    pub fn broadcast_except(&mut self, except: &str, message: &ServerMessage) -> Vec<String> {
        let tick = self.current_tick;
        let mut dropped = Vec::new();

        for slot in &mut self.slots {
            if slot.player_id == except || !slot.liveness.is_live() {
                continue;
            }
            if let Some(outbox) = &slot.outbox {
                if outbox.emit(message.clone()).is_err() {
                    slot.liveness.mark_disconnected();
                    slot.outbox = None;
                    slot.disconnected_at_tick = Some(tick);
                    dropped.push(slot.player_id.clone());
                }
            }
        }
        dropped
    }

    /// Disconnect a slot only if its bound transport is actually gone.
    /// A connection that was already superseded by a reconnect leaves the
    /// new binding untouched.
    pub fn drop_closed_transport(&mut self, player_id: &str) -> bool {
        let tick = self.current_tick;
        if let Some(slot) = self.slot_mut(player_id) {
            if matches!(&slot.outbox, Some(outbox) if outbox.is_closed()) {
                slot.liveness.mark_disconnected();
                slot.outbox = None;
                slot.disconnected_at_tick = Some(tick);
                return true;
            }
        }
        false
    }

    /// Transport-level disconnect. The slot stays; the match keeps running.
    /// Returns false if the player owns no slot here.
    pub fn drop_transport(&mut self, player_id: &str) -> bool {
        let tick = self.current_tick;
        match self.slot_mut(player_id) {
            Some(slot) => {
                slot.liveness.mark_disconnected();
                slot.outbox = None;
                slot.disconnected_at_tick = Some(tick);
                true
            }
            None => false,
        }
    }

    /// Whether every slot is unreachable.
    pub fn all_disconnected(&self) -> bool {
        self.slots.iter().all(|s| !s.liveness.is_live())
    }

    /// Validate and perform a reconnect, binding the new outbox to the
    /// player's slot. On success the caller sends `reconnect-status` and the
    /// returned snapshot; the slot is live again for subsequent broadcasts.
    pub fn reconnect(
        &mut self,
        player_id: &str,
        outbox: Outbox,
        now: Instant,
    ) -> Result<ReconnectSnapshot, ReconnectError> {
        if self.phase == MatchPhase::Ended {
            return Err(ReconnectError::MatchEnded);
        }
        if !self.contains_player(player_id) {
            return Err(ReconnectError::NotInMatch);
        }

        let covered = match self
            .slots
            .iter()
            .find(|s| s.player_id == player_id)
            .and_then(|s| s.disconnected_at_tick)
        {
            Some(gone_since) => self.history.covers(gone_since.saturating_add(1)),
            // Never marked gone (e.g. replacing a live connection): nothing
            // was missed beyond what the window holds anyway.
            None => true,
        };
        if !covered {
            return Err(ReconnectError::StateTooOld);
        }

        if let Some(slot) = self.slot_mut(player_id) {
            slot.liveness.mark_reconnecting();
            slot.outbox = Some(outbox);
            slot.liveness.restore(now);
            slot.disconnected_at_tick = None;
        }

        Ok(ReconnectSnapshot {
            match_id: self.id.clone(),
            current_tick: self.current_tick,
            seed: self.seed,
            team_assignment: self.team_assignment(),
            history: self.history.replay(),
        })
    }

    /// Run one scheduler firing. Broadcasts the batch and the tick-sync,
    /// archives the batch, sweeps liveness, compares hashes, then advances
    /// the tick counter. Returns `None` unless the match is running.
    pub fn run_tick(&mut self, now: Instant, server_time_ms: i64) -> Option<TickOutcome> {
        if self.phase != MatchPhase::Running {
            return None;
        }

        let tick = self.current_tick + 1;
        let batch = self.buffer.drain(tick);
        let mut outcome = TickOutcome {
            tick,
            ..Default::default()
        };

        outcome.disconnected.extend(self.broadcast(&ServerMessage::CommandsBatch {
            tick,
            commands: batch.clone(),
        }));
        outcome.disconnected.extend(self.broadcast(&ServerMessage::TickSync {
            tick,
            server_time_ms,
        }));

        self.history.record(tick, batch);

        // Liveness sweep: collect transitions first, then announce them, so
        // the room broadcasts see the post-transition reachability.
        let mut transitions = Vec::new();
        for slot in &mut self.slots {
            if let Some(event) = slot.liveness.sweep(now, &self.thresholds) {
                transitions.push((slot.player_id.clone(), event));
            }
        }
        for (player_id, event) in transitions {
            match event {
                LivenessEvent::Lagging { ms_since_last_message } => {
                    self.broadcast(&ServerMessage::PlayerLagging {
                        player_id: player_id.clone(),
                        ms_since_last_message,
                    });
                    outcome.lagging.push((player_id, ms_since_last_message));
                }
                LivenessEvent::TimedOut { ms_since_last_message } => {
                    self.broadcast(&ServerMessage::PlayerTimeout {
                        player_id: player_id.clone(),
                        ms_since_last_message,
                    });
                    // Timed-out players follow the disconnect policy: the
                    // slot stays, the transport handle goes.
                    let match_id = self.id.clone();
                    if let Some(slot) = self.slot_mut(&player_id) {
                        slot.outbox = None;
                        slot.disconnected_at_tick = Some(tick);
                    }
                    self.broadcast(&ServerMessage::PlayerDisconnected {
                        player_id: player_id.clone(),
                        match_id,
                    });
                    outcome.timed_out.push((player_id.clone(), ms_since_last_message));
                    outcome.disconnected.push(player_id);
                }
            }
        }

        let live = self.live_player_ids();
        let reports = self.oracle.check(tick, &live);
        for report in &reports {
            self.broadcast(&ServerMessage::DesyncDetected {
                tick: report.tick,
                hashes: report.hashes.clone(),
            });
        }
        if !reports.is_empty() && !self.desync_reported {
            self.desync_reported = true;
            outcome.first_desync = true;
        }
        outcome.desyncs = reports;

        self.current_tick = tick;
        outcome.all_disconnected = self.all_disconnected();
        Some(outcome)
    }

    /// Transition to ended. Returns false if already terminal (the first
    /// reason wins and `match-end` goes out exactly once).
    pub fn end(&mut self, reason: &str) -> bool {
        if self.phase == MatchPhase::Ended {
            return false;
        }
        self.phase = MatchPhase::Ended;
        self.end_reason = Some(reason.to_string());

        if let Some(started) = self.started_at {
            debug!(
                match_id = %self.id,
                reason,
                ticks = self.current_tick,
                duration_ms = started.elapsed().as_millis() as u64,
                "match ended"
            );
        }

        let message = ServerMessage::MatchEnd {
            match_id: self.id.clone(),
            reason: reason.to_string(),
        };
        self.broadcast(&message);
        true
    }

    /// Age of the session (idle-teardown bookkeeping).
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created_at)
    }
}

// =============================================================================
// MATCH REGISTRY
// =============================================================================

/// Owns every live session and the player → match index.
pub struct MatchRegistry {
    matches: RwLock<BTreeMap<MatchId, Arc<RwLock<MatchSession>>>>,
    player_matches: RwLock<BTreeMap<String, MatchId>>,
}

impl MatchRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            matches: RwLock::new(BTreeMap::new()),
            player_matches: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a freshly formed session and index its players.
    pub async fn insert(&self, session: MatchSession) -> Arc<RwLock<MatchSession>> {
        let id = session.id.clone();
        let player_ids: Vec<String> = session
            .slots()
            .iter()
            .map(|s| s.player_id.clone())
            .collect();

        let session = Arc::new(RwLock::new(session));
        self.matches.write().await.insert(id.clone(), session.clone());

        let mut index = self.player_matches.write().await;
        for player_id in player_ids {
            index.insert(player_id, id.clone());
        }

        session
    }

    /// Look up a session by id.
    pub async fn get(&self, id: &str) -> Option<Arc<RwLock<MatchSession>>> {
        self.matches.read().await.get(id).cloned()
    }

    /// Look up the session a player currently belongs to.
    pub async fn get_for_player(&self, player_id: &str) -> Option<Arc<RwLock<MatchSession>>> {
        let id = self.player_matches.read().await.get(player_id).cloned()?;
        self.get(&id).await
    }

    /// Remove a session and its player index entries.
    pub async fn remove(&self, id: &str) {
        let removed = self.matches.write().await.remove(id);
        if let Some(session) = removed {
            let session = session.read().await;
            let mut index = self.player_matches.write().await;
            for slot in session.slots() {
                if index.get(&slot.player_id).map(String::as_str) == Some(id) {
                    index.remove(&slot.player_id);
                }
            }
        }
    }

    /// Live session count.
    pub async fn count(&self) -> usize {
        self.matches.read().await.len()
    }

    /// Snapshot of every live session (shutdown sweep).
    pub async fn all(&self) -> Vec<Arc<RwLock<MatchSession>>> {
        self.matches.read().await.values().cloned().collect()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::activity::ActivityState;
    use crate::engine::command::Command;
    use crate::network::protocol::ServerMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_config() -> EngineConfig {
        EngineConfig::default()
    }

    fn make_session(
        config: &EngineConfig,
        ids: &[&str],
    ) -> (MatchSession, Vec<mpsc::Receiver<ServerMessage>>) {
        let now = Instant::now();
        let mut players = Vec::new();
        let mut receivers = Vec::new();
        for id in ids {
            let (outbox, rx) = Outbox::channel();
            players.push((id.to_string(), format!("user-{}", id), outbox));
            receivers.push(rx);
        }
        let session = MatchSession::new(generate_match_id(), config, 42, players, now);
        (session, receivers)
    }

    fn running_session(
        config: &EngineConfig,
        ids: &[&str],
    ) -> (MatchSession, Vec<mpsc::Receiver<ServerMessage>>) {
        let (mut session, receivers) = make_session(config, ids);
        session.begin_running(Instant::now());
        (session, receivers)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn cmd(kind: &str, data: serde_json::Value) -> Command {
        Command {
            player_id: String::new(),
            kind: kind.into(),
            data,
        }
    }

    #[test]
    fn test_match_id_format() {
        let id = generate_match_id();
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "match");
        assert!(parts[1].parse::<i64>().is_ok());
        assert!(!parts[2].is_empty());
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_team_assignment_by_formation_order() {
        let config = EngineConfig {
            game_mode: GameMode::Doubles,
            ..test_config()
        };
        let (session, _rx) = make_session(&config, &["p1", "p2", "p3", "p4"]);

        let teams = session.team_assignment();
        assert_eq!(teams["p1"], 0);
        assert_eq!(teams["p2"], 0);
        assert_eq!(teams["p3"], 1);
        assert_eq!(teams["p4"], 1);
    }

    #[test]
    fn test_countdown_blocks_ticks_and_submissions() {
        let config = test_config();
        let (mut session, _rx) = make_session(&config, &["p1", "p2"]);

        assert_eq!(session.phase(), MatchPhase::Countdown);
        assert!(session.run_tick(Instant::now(), 0).is_none());
        assert_eq!(session.current_tick(), 0);

        let verdict = session.submit_commands("p1", 3, vec![cmd("a", json!(null))]);
        assert_eq!(verdict, Err(CommandRejected::MatchEnded));
    }

    #[test]
    fn test_batch_order_and_identical_payloads() {
        let config = test_config();
        let (mut session, mut receivers) = running_session(&config, &["p1", "p2"]);

        // p2 submits first, p1 second; the batch must still be p1 then p2.
        session
            .submit_commands("p2", 3, vec![cmd("b", json!(null))])
            .unwrap();
        session
            .submit_commands("p1", 3, vec![cmd("a", json!(null))])
            .unwrap();

        let now = Instant::now();
        session.run_tick(now, 1).unwrap();
        session.run_tick(now, 2).unwrap();
        session.run_tick(now, 3).unwrap();

        let mut payloads = Vec::new();
        for rx in &mut receivers {
            let messages = drain(rx);
            let batch3 = messages
                .iter()
                .find_map(|m| match m {
                    ServerMessage::CommandsBatch { tick: 3, commands } => Some(commands.clone()),
                    _ => None,
                })
                .expect("batch for tick 3");
            payloads.push(batch3);
        }

        assert_eq!(payloads[0], payloads[1]);
        let order: Vec<(&str, &str)> = payloads[0]
            .iter()
            .map(|c| (c.player_id.as_str(), c.kind.as_str()))
            .collect();
        assert_eq!(order, vec![("p1", "a"), ("p2", "b")]);
    }

    #[test]
    fn test_tick_sync_follows_batch_and_is_monotonic() {
        let config = test_config();
        let (mut session, mut receivers) = running_session(&config, &["p1", "p2"]);

        let now = Instant::now();
        for i in 1..=3 {
            session.run_tick(now, i).unwrap();
        }

        let messages = drain(&mut receivers[0]);
        let mut last_sync = 0;
        let mut batch_seen_for: Option<Tick> = None;
        for message in &messages {
            match message {
                ServerMessage::CommandsBatch { tick, .. } => {
                    batch_seen_for = Some(*tick);
                }
                ServerMessage::TickSync { tick, .. } => {
                    assert_eq!(batch_seen_for, Some(*tick), "batch precedes sync");
                    assert!(*tick > last_sync, "tick-sync strictly increasing");
                    last_sync = *tick;
                }
                _ => {}
            }
        }
        assert_eq!(last_sync, 3);
        assert_eq!(session.current_tick(), 3);
    }

    #[test]
    fn test_submission_window_acks() {
        let config = test_config();
        let (mut session, _rx) = running_session(&config, &["p1", "p2"]);

        let now = Instant::now();
        for _ in 0..50 {
            session.run_tick(now, 0).unwrap();
        }
        assert_eq!(session.current_tick(), 50);

        // Late: tick 50 at current tick 50.
        assert_eq!(
            session.submit_commands("p1", 50, vec![]),
            Err(CommandRejected::Late)
        );
        // Too far: beyond current + max_future_ticks.
        assert_eq!(
            session.submit_commands("p1", 50 + config.max_future_ticks + 1, vec![]),
            Err(CommandRejected::TooFarFuture)
        );
        // Stranger: not in the match.
        assert_eq!(
            session.submit_commands("intruder", 51, vec![]),
            Err(CommandRejected::WrongMatch)
        );
        // In-window.
        assert!(session.submit_commands("p1", 51, vec![]).is_ok());
    }

    #[test]
    fn test_rejected_commands_never_broadcast() {
        let config = test_config();
        let (mut session, mut receivers) = running_session(&config, &["p1", "p2"]);
        let now = Instant::now();

        session.run_tick(now, 0).unwrap();
        let _ = session.submit_commands("p1", 1, vec![cmd("late", json!(null))]);
        let _ = session.submit_commands("p1", 900, vec![cmd("far", json!(null))]);

        for _ in 0..5 {
            session.run_tick(now, 0).unwrap();
        }

        for message in drain(&mut receivers[0]) {
            if let ServerMessage::CommandsBatch { commands, .. } = message {
                assert!(commands.is_empty());
            }
        }
    }

    #[test]
    fn test_disconnected_player_contributes_nothing() {
        let config = test_config();
        let (mut session, mut receivers) = running_session(&config, &["p1", "p2"]);
        let now = Instant::now();

        session.submit_commands("p2", 1, vec![cmd("pre", json!(null))]).unwrap();
        session.run_tick(now, 0).unwrap();

        assert!(session.drop_transport("p2"));
        // p2 cannot submit while the match runs on; their slot yields empty
        // lists each tick.
        for _ in 0..3 {
            session.run_tick(now, 0).unwrap();
        }

        let messages = drain(&mut receivers[0]);
        for message in &messages {
            if let ServerMessage::CommandsBatch { tick, commands } = message {
                if *tick > 1 {
                    assert!(commands.iter().all(|c| c.player_id != "p2"));
                }
            }
        }
        assert!(!session.all_disconnected());
    }

    #[test]
    fn test_silent_player_lags_then_times_out() {
        // 10-tick lagging / 40-tick timeout at 50ms ticks: 500ms and 2000ms.
        let config = EngineConfig {
            timeout_ticks: 10,
            disconnect_ticks: 40,
            ..test_config()
        };
        let (mut session, mut receivers) = make_session(&config, &["p1", "p2"]);
        let base = Instant::now();
        session.begin_running(base);

        // p1 heartbeats; p2 goes silent after the start.
        session.touch_activity("p1", base + std::time::Duration::from_millis(550));
        let outcome = session
            .run_tick(base + std::time::Duration::from_millis(600), 0)
            .unwrap();
        assert_eq!(outcome.lagging.len(), 1);
        assert_eq!(outcome.lagging[0].0, "p2");
        assert!(outcome.timed_out.is_empty());

        session.touch_activity("p1", base + std::time::Duration::from_millis(1900));
        let outcome = session
            .run_tick(base + std::time::Duration::from_millis(2000), 0)
            .unwrap();
        assert_eq!(outcome.timed_out.len(), 1);
        assert_eq!(outcome.timed_out[0].0, "p2");

        // p1 observes the downgrade events and is never flagged itself.
        let messages = drain(&mut receivers[0]);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::PlayerLagging { player_id, .. } if player_id == "p2"
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::PlayerTimeout { player_id, .. } if player_id == "p2"
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::PlayerDisconnected { player_id, .. } if player_id == "p2"
        )));
        assert!(!messages.iter().any(|m| matches!(
            m,
            ServerMessage::PlayerLagging { player_id, .. } if player_id == "p1"
        )));

        // Timed out players need the reconnect path to come back.
        let slot = session.slots().iter().find(|s| s.player_id == "p2").unwrap();
        assert_eq!(slot.liveness.state(), ActivityState::TimedOut);
        assert!(!slot.is_reachable());
    }

    #[test]
    fn test_all_disconnected_flag() {
        let config = test_config();
        let (mut session, _receivers) = running_session(&config, &["p1", "p2"]);

        session.drop_transport("p1");
        session.drop_transport("p2");

        let outcome = session.run_tick(Instant::now(), 0).unwrap();
        assert!(outcome.all_disconnected);
    }

    #[test]
    fn test_reconnect_replays_retained_window() {
        let config = test_config();
        let (mut session, _receivers) = running_session(&config, &["p1", "p2"]);
        let now = Instant::now();

        for i in 1..=30 {
            session
                .submit_commands("p1", i, vec![cmd("step", json!(i))])
                .unwrap();
            session.run_tick(now, 0).unwrap();
        }

        session.drop_transport("p1");
        for _ in 31..=80 {
            session.run_tick(now, 0).unwrap();
        }
        assert_eq!(session.current_tick(), 80);

        let (outbox, mut rx) = Outbox::channel();
        let snapshot = session.reconnect("p1", outbox, now).unwrap();

        assert_eq!(snapshot.current_tick, 80);
        assert_eq!(snapshot.seed, 42);
        assert_eq!(snapshot.history.len(), 80);
        let ticks: Vec<Tick> = snapshot.history.iter().map(|b| b.tick).collect();
        assert_eq!(ticks, (1..=80).collect::<Vec<_>>());

        // The slot receives broadcasts again.
        session.run_tick(now, 0).unwrap();
        let messages = drain(&mut rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::CommandsBatch { tick: 81, .. })));
    }

    #[test]
    fn test_reconnect_rejected_when_state_too_old() {
        let config = EngineConfig {
            reconnect_history_ticks: 10,
            ..test_config()
        };
        let (mut session, _receivers) = running_session(&config, &["p1", "p2"]);
        let now = Instant::now();

        for _ in 0..5 {
            session.run_tick(now, 0).unwrap();
        }
        session.drop_transport("p1");

        // 20 more ticks: the window [16, 25] no longer covers tick 6.
        for _ in 0..20 {
            session.run_tick(now, 0).unwrap();
        }

        let (outbox, _rx) = Outbox::channel();
        let verdict = session.reconnect("p1", outbox, now);
        assert_eq!(verdict.unwrap_err(), ReconnectError::StateTooOld);
        assert_eq!(ReconnectError::StateTooOld.to_string(), "state too old");
    }

    #[test]
    fn test_reconnect_validation_errors() {
        let config = test_config();
        let (mut session, _receivers) = running_session(&config, &["p1", "p2"]);

        let (outbox, _rx) = Outbox::channel();
        assert_eq!(
            session.reconnect("stranger", outbox, Instant::now()).unwrap_err(),
            ReconnectError::NotInMatch
        );

        session.end("completed");
        let (outbox, _rx) = Outbox::channel();
        assert_eq!(
            session.reconnect("p1", outbox, Instant::now()).unwrap_err(),
            ReconnectError::MatchEnded
        );
    }

    #[test]
    fn test_desync_broadcast_to_all() {
        let config = test_config();
        let (mut session, mut receivers) = running_session(&config, &["p1", "p2", "p3"]);
        let now = Instant::now();

        for _ in 0..5 {
            session.run_tick(now, 0).unwrap();
        }

        session.submit_hash("p1", 5, "A".into());
        session.submit_hash("p2", 5, "A".into());
        session.submit_hash("p3", 5, "B".into());

        let outcome = session.run_tick(now, 0).unwrap();
        assert_eq!(outcome.desyncs.len(), 1);
        assert!(outcome.first_desync);
        assert_eq!(outcome.desyncs[0].tick, 5);

        for rx in &mut receivers {
            let messages = drain(rx);
            let detected = messages.iter().find_map(|m| match m {
                ServerMessage::DesyncDetected { tick, hashes } => Some((*tick, hashes.clone())),
                _ => None,
            });
            let (tick, hashes) = detected.expect("desync-detected");
            assert_eq!(tick, 5);
            assert_eq!(hashes.get("p1").map(String::as_str), Some("A"));
            assert_eq!(hashes.get("p3").map(String::as_str), Some("B"));
        }
    }

    #[test]
    fn test_first_desync_reported_once() {
        let config = test_config();
        let (mut session, _receivers) = running_session(&config, &["p1", "p2"]);
        let now = Instant::now();

        for _ in 0..5 {
            session.run_tick(now, 0).unwrap();
        }

        session.submit_hash("p1", 4, "A".into());
        session.submit_hash("p2", 4, "B".into());
        session.submit_hash("p1", 5, "C".into());
        session.submit_hash("p2", 5, "D".into());

        let outcome = session.run_tick(now, 0).unwrap();
        assert_eq!(outcome.desyncs.len(), 2);
        assert!(outcome.first_desync);

        session.submit_hash("p1", 6, "E".into());
        session.submit_hash("p2", 6, "F".into());
        let outcome = session.run_tick(now, 0).unwrap();
        assert_eq!(outcome.desyncs.len(), 1);
        assert!(!outcome.first_desync);
    }

    #[test]
    fn test_end_is_terminal_and_single() {
        let config = test_config();
        let (mut session, mut receivers) = running_session(&config, &["p1", "p2"]);

        assert!(session.end("server-shutdown"));
        assert!(!session.end("completed"));
        assert_eq!(session.end_reason(), Some("server-shutdown"));

        assert!(session.run_tick(Instant::now(), 0).is_none());
        assert_eq!(session.current_tick(), 0);

        let ends: Vec<_> = drain(&mut receivers[0])
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::MatchEnd { .. }))
            .collect();
        assert_eq!(ends.len(), 1);
    }

    #[test]
    fn test_closed_outbox_marks_disconnected_on_broadcast() {
        let config = test_config();
        let (mut session, mut receivers) = running_session(&config, &["p1", "p2"]);

        // Simulate a vanished client: its receiver is gone.
        receivers.remove(1);

        let outcome = session.run_tick(Instant::now(), 0).unwrap();
        assert_eq!(outcome.disconnected, vec!["p2".to_string()]);

        let slot = session.slots().iter().find(|s| s.player_id == "p2").unwrap();
        assert_eq!(slot.liveness.state(), ActivityState::Disconnected);
        assert!(!slot.is_reachable());
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = MatchRegistry::new();
        let config = test_config();
        let (session, _receivers) = make_session(&config, &["p1", "p2"]);
        let id = session.id.clone();

        registry.insert(session).await;
        assert_eq!(registry.count().await, 1);
        assert!(registry.get(&id).await.is_some());
        assert!(registry.get_for_player("p1").await.is_some());

        registry.remove(&id).await;
        assert_eq!(registry.count().await, 0);
        assert!(registry.get_for_player("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_registry_keeps_newer_assignment() {
        let registry = MatchRegistry::new();
        let config = test_config();

        let (first, _r1) = make_session(&config, &["p1", "p2"]);
        let first_id = first.id.clone();
        registry.insert(first).await;

        // p1's old match is torn down after they were indexed into a new one.
        let (second, _r2) = make_session(&config, &["p1", "p3"]);
        let second_id = second.id.clone();
        registry.insert(second).await;

        registry.remove(&first_id).await;
        let found = registry.get_for_player("p1").await.expect("still indexed");
        assert_eq!(found.read().await.id, second_id);
    }
}
