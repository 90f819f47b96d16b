//! Matchmaking Queue
//!
//! Strict FIFO queue feeding match formation. A periodic task (driven by the
//! server) pops a prefix of connected players whenever enough are waiting
//! for the configured mode. No skill or rating matching; enqueue order is
//! the only ordering.

use std::collections::VecDeque;
use std::time::Instant;

use thiserror::Error;

/// A player waiting for a match.
#[derive(Debug, Clone)]
pub struct QueuedPlayer {
    /// Stable player identifier.
    pub player_id: String,
    /// Display name carried into the match.
    pub username: String,
    /// When the player joined the queue.
    pub enqueued_at: Instant,
}

/// Snapshot returned to a joining player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// 1-based position in the queue.
    pub position: usize,
    /// Total queued players, including the joiner.
    pub queue_size: usize,
}

/// Queue policy violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The player id is already queued.
    #[error("already queued")]
    AlreadyQueued,
}

/// FIFO matchmaking queue.
///
/// A player id appears at most once. Leaving when not queued is a silent
/// no-op.
#[derive(Debug, Default)]
pub struct MatchmakingQueue {
    entries: VecDeque<QueuedPlayer>,
}

impl MatchmakingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a player.
    pub fn join(
        &mut self,
        player_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Result<QueueStatus, QueueError> {
        let player_id = player_id.into();
        if self.contains(&player_id) {
            return Err(QueueError::AlreadyQueued);
        }

        self.entries.push_back(QueuedPlayer {
            player_id,
            username: username.into(),
            enqueued_at: Instant::now(),
        });

        Ok(QueueStatus {
            position: self.entries.len(),
            queue_size: self.entries.len(),
        })
    }

    /// Remove a player. Returns false if they were not queued.
    pub fn leave(&mut self, player_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.player_id != player_id);
        self.entries.len() != before
    }

    /// Whether a player id is queued.
    pub fn contains(&self, player_id: &str) -> bool {
        self.entries.iter().any(|e| e.player_id == player_id)
    }

    /// Queued player count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Try to form one match of exactly `size` players.
    ///
    /// Disconnected players at the head are dropped silently; a formation
    /// only succeeds when the first `size` remaining players are all still
    /// connected, and removes them atomically in enqueue order. Call
    /// repeatedly to form as many matches as the queue allows.
    pub fn form_match(
        &mut self,
        size: usize,
        mut is_connected: impl FnMut(&str) -> bool,
    ) -> Option<Vec<QueuedPlayer>> {
        if size == 0 {
            return None;
        }

        loop {
            while let Some(head) = self.entries.front() {
                if is_connected(&head.player_id) {
                    break;
                }
                self.entries.pop_front();
            }

            if self.entries.len() < size {
                return None;
            }

            let stale: Vec<String> = self
                .entries
                .iter()
                .take(size)
                .filter(|e| !is_connected(&e.player_id))
                .map(|e| e.player_id.clone())
                .collect();

            if stale.is_empty() {
                return Some(self.entries.drain(..size).collect());
            }

            // Disconnected players inside the prefix would starve formation;
            // drop them and retry with the compacted queue.
            self.entries.retain(|e| !stale.contains(&e.player_id));
        }
    }
}
