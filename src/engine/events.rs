//! Public Event Surface
//!
//! Typed observer registration for embedders. Listeners are registered
//! against the whole event stream and receive every [`EngineEvent`];
//! registration returns a [`Subscription`] token whose release (or drop)
//! removes the listener. Listener panics are caught and logged so an
//! embedder bug can never stall a tick loop.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::command::Tick;
use crate::config::GameMode;

/// Lifecycle and liveness notifications for embedders.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A match was formed from the queue.
    MatchCreated {
        /// Match identifier.
        match_id: String,
        /// Composition.
        game_mode: GameMode,
        /// Formed players in slot order.
        player_ids: Vec<String>,
    },
    /// Countdown finished; the tick loop is starting.
    MatchStarted {
        /// Match identifier.
        match_id: String,
        /// Seed forwarded to clients.
        seed: u32,
    },
    /// The match reached its terminal state.
    MatchEnded {
        /// Match identifier.
        match_id: String,
        /// Terminal reason (`completed`, `all-disconnected`, …).
        reason: String,
    },
    /// A player crossed the lagging threshold.
    PlayerLagging {
        /// Match identifier.
        match_id: String,
        /// Player identifier.
        player_id: String,
        /// Observed silence.
        ms_since_last_message: u64,
    },
    /// A player crossed the hard silence threshold.
    PlayerTimeout {
        /// Match identifier.
        match_id: String,
        /// Player identifier.
        player_id: String,
        /// Observed silence.
        ms_since_last_message: u64,
    },
    /// A player's transport dropped mid-match.
    PlayerDisconnected {
        /// Match identifier.
        match_id: String,
        /// Player identifier.
        player_id: String,
    },
    /// A player rejoined their match.
    PlayerReconnected {
        /// Match identifier.
        match_id: String,
        /// Player identifier.
        player_id: String,
    },
    /// Clients disagree on state. Reported once per match.
    DesyncDetected {
        /// Match identifier.
        match_id: String,
        /// Disputed tick.
        tick: Tick,
        /// Every submitted digest, by player.
        hashes: BTreeMap<String, String>,
    },
}

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
}

/// Observer registry shared between the server and embedders.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The returned token keeps the registration
    /// alive; releasing or dropping it unsubscribes.
    pub fn subscribe(
        &self,
        listener: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, Arc::new(listener));

        Subscription {
            id,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Deliver an event to every listener. Dispatch happens outside the
    /// registry lock so listeners may subscribe/unsubscribe reentrantly.
    pub fn emit(&self, event: EngineEvent) {
        let listeners: Vec<Listener> = self.lock().listeners.values().cloned().collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("engine event listener panicked; event dropped for that listener");
            }
        }
    }

    /// Registered listener count.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Opaque registration token; unsubscribes on release.
pub struct Subscription {
    id: u64,
    registry: Arc<Mutex<Registry>>,
}

impl Subscription {
    /// Explicitly remove the listener.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.listeners.remove(&self.id);
    }
}
