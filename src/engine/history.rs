//! Broadcast History
//!
//! Bounded record of what was broadcast, kept for reconnect replay. Each
//! running match appends its flattened batch after every tick; a rejoining
//! client receives the whole retained window and replays it to catch up.
//! The window is contiguous: ticks are appended in order and evicted from
//! the front, so the retained range is always `[first, last]` with no gaps.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::command::{Command, Tick};

/// One broadcast tick as retained for replay (and as sent in
/// `reconnect-state`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickBatch {
    /// Tick number.
    pub tick: Tick,
    /// The authoritative flattened batch broadcast for that tick.
    pub commands: Vec<Command>,
}

/// Bounded, contiguous record of broadcast batches.
#[derive(Debug)]
pub struct BroadcastHistory {
    capacity: usize,
    entries: VecDeque<TickBatch>,
}

impl BroadcastHistory {
    /// History retaining at most `capacity` ticks.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append a broadcast batch, evicting the oldest entry when full.
    pub fn record(&mut self, tick: Tick, commands: Vec<Command>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TickBatch { tick, commands });
    }

    /// Oldest retained tick.
    pub fn first_tick(&self) -> Option<Tick> {
        self.entries.front().map(|b| b.tick)
    }

    /// Newest retained tick.
    pub fn last_tick(&self) -> Option<Tick> {
        self.entries.back().map(|b| b.tick)
    }

    /// Whether every broadcast tick from `from` onward is still retained.
    /// True when nothing has been broadcast yet (nothing was missed).
    pub fn covers(&self, from: Tick) -> bool {
        match self.first_tick() {
            Some(first) => first <= from,
            None => true,
        }
    }

    /// The full retained window, tick-ascending, for `reconnect-state`.
    pub fn replay(&self) -> Vec<TickBatch> {
        self.entries.iter().cloned().collect()
    }

    /// Retained tick count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
