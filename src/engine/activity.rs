//! Player Liveness Tracking
//!
//! Tick-denominated silence thresholds over a monotonic clock. Any inbound
//! event from a player refreshes their activity timestamp; after each
//! broadcast tick the per-slot state machine is swept:
//!
//! ```text
//!   active ⇄ lagging ──→ timedOut
//!     │                     │
//!     └── disconnected ←────┘   (reconnect restores active)
//! ```
//!
//! `timedOut` and `disconnected` are only left through a successful
//! reconnect. The active/lagging oscillation is expected under jitter and
//! produces an event only on the way down.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Per-slot liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityState {
    /// Heard from recently.
    Active,
    /// Silent past the lagging threshold.
    Lagging,
    /// Silent past the hard threshold; requires reconnect.
    TimedOut,
    /// Transport gone; slot retained for reconnect.
    Disconnected,
    /// Reconnect in progress.
    Reconnecting,
}

/// Silence thresholds, converted from ticks at construction.
#[derive(Debug, Clone, Copy)]
pub struct ActivityThresholds {
    /// Silence before `active → lagging`.
    pub lagging_after: Duration,
    /// Silence before `→ timedOut`.
    pub timeout_after: Duration,
}

impl ActivityThresholds {
    /// Build thresholds from tick counts and the tick length in ms.
    pub fn from_ticks(timeout_ticks: u32, disconnect_ticks: u32, tick_ms: u64) -> Self {
        Self {
            lagging_after: Duration::from_millis(timeout_ticks as u64 * tick_ms),
            timeout_after: Duration::from_millis(disconnect_ticks as u64 * tick_ms),
        }
    }
}

/// Transition produced by a sweep, for the server to broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Crossed the lagging threshold.
    Lagging {
        /// Milliseconds since the player's last message.
        ms_since_last_message: u64,
    },
    /// Crossed the hard threshold.
    TimedOut {
        /// Milliseconds since the player's last message.
        ms_since_last_message: u64,
    },
}

/// Liveness record for one player slot.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    state: ActivityState,
    last_activity: Instant,
}

impl Liveness {
    /// Fresh record in `active` state.
    pub fn new(now: Instant) -> Self {
        Self {
            state: ActivityState::Active,
            last_activity: now,
        }
    }

    /// Current state.
    pub fn state(&self) -> ActivityState {
        self.state
    }

    /// Timestamp of the last inbound event.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Record an inbound event. Refreshes the timestamp but never promotes
    /// out of `lagging` directly; recovery happens at the next sweep so the
    /// transition stays serialized with the tick loop.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Transport dropped.
    pub fn mark_disconnected(&mut self) {
        self.state = ActivityState::Disconnected;
    }

    /// Reconnect validation started.
    pub fn mark_reconnecting(&mut self) {
        self.state = ActivityState::Reconnecting;
    }

    /// Successful reconnect.
    pub fn restore(&mut self, now: Instant) {
        self.state = ActivityState::Active;
        self.last_activity = now;
    }

    /// Whether the slot is reachable for broadcasts.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ActivityState::Active | ActivityState::Lagging)
    }

    /// Post-tick sweep. Only `active` and `lagging` slots are assessed;
    /// everything else is the reconnect path's business.
    pub fn sweep(&mut self, now: Instant, thresholds: &ActivityThresholds) -> Option<LivenessEvent> {
        if !self.is_live() {
            return None;
        }

        let silence = now.saturating_duration_since(self.last_activity);
        let ms = silence.as_millis() as u64;

        if silence >= thresholds.timeout_after {
            self.state = ActivityState::TimedOut;
            return Some(LivenessEvent::TimedOut { ms_since_last_message: ms });
        }

        match self.state {
            ActivityState::Active if silence >= thresholds.lagging_after => {
                self.state = ActivityState::Lagging;
                Some(LivenessEvent::Lagging { ms_since_last_message: ms })
            }
            ActivityState::Lagging if silence < thresholds.lagging_after => {
                self.state = ActivityState::Active;
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ActivityThresholds {
        // 20-tick lagging / 60-tick timeout at 50ms ticks.
        ActivityThresholds::from_ticks(20, 60, 50)
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_threshold_conversion() {
        let t = thresholds();
        assert_eq!(t.lagging_after, Duration::from_millis(1000));
        assert_eq!(t.timeout_after, Duration::from_millis(3000));
    }

    #[test]
    fn test_quiet_player_stays_active_below_threshold() {
        let base = Instant::now();
        let mut liveness = Liveness::new(base);

        assert!(liveness.sweep(at(base, 999), &thresholds()).is_none());
        assert_eq!(liveness.state(), ActivityState::Active);
    }

    #[test]
    fn test_lagging_then_timeout() {
        let base = Instant::now();
        let mut liveness = Liveness::new(base);
        let t = thresholds();

        let event = liveness.sweep(at(base, 1200), &t);
        assert_eq!(event, Some(LivenessEvent::Lagging { ms_since_last_message: 1200 }));
        assert_eq!(liveness.state(), ActivityState::Lagging);

        // Still silent, still short of the hard threshold.
        assert!(liveness.sweep(at(base, 2000), &t).is_none());

        let event = liveness.sweep(at(base, 3100), &t);
        assert_eq!(event, Some(LivenessEvent::TimedOut { ms_since_last_message: 3100 }));
        assert_eq!(liveness.state(), ActivityState::TimedOut);
    }

    #[test]
    fn test_lagging_recovers_after_touch() {
        let base = Instant::now();
        let mut liveness = Liveness::new(base);
        let t = thresholds();

        liveness.sweep(at(base, 1500), &t);
        assert_eq!(liveness.state(), ActivityState::Lagging);

        liveness.touch(at(base, 1600));
        assert!(liveness.sweep(at(base, 1700), &t).is_none());
        assert_eq!(liveness.state(), ActivityState::Active);
    }

    #[test]
    fn test_oscillation_emits_each_downgrade() {
        let base = Instant::now();
        let mut liveness = Liveness::new(base);
        let t = thresholds();

        assert!(matches!(
            liveness.sweep(at(base, 1100), &t),
            Some(LivenessEvent::Lagging { .. })
        ));
        liveness.touch(at(base, 1200));
        liveness.sweep(at(base, 1300), &t);
        assert_eq!(liveness.state(), ActivityState::Active);

        assert!(matches!(
            liveness.sweep(at(base, 2400), &t),
            Some(LivenessEvent::Lagging { .. })
        ));
    }

    #[test]
    fn test_timed_out_needs_reconnect() {
        let base = Instant::now();
        let mut liveness = Liveness::new(base);
        let t = thresholds();

        liveness.sweep(at(base, 4000), &t);
        assert_eq!(liveness.state(), ActivityState::TimedOut);

        // Fresh traffic alone does not revive the slot.
        liveness.touch(at(base, 4100));
        assert!(liveness.sweep(at(base, 4200), &t).is_none());
        assert_eq!(liveness.state(), ActivityState::TimedOut);

        liveness.restore(at(base, 5000));
        assert_eq!(liveness.state(), ActivityState::Active);
        assert!(liveness.sweep(at(base, 5100), &t).is_none());
    }

    #[test]
    fn test_disconnected_not_swept() {
        let base = Instant::now();
        let mut liveness = Liveness::new(base);

        liveness.mark_disconnected();
        assert!(liveness.sweep(at(base, 60_000), &thresholds()).is_none());
        assert_eq!(liveness.state(), ActivityState::Disconnected);
        assert!(!liveness.is_live());
    }
}
