//! Desync Oracle
//!
//! Clients hash their simulation state each tick and submit the digest; the
//! oracle compares digests per tick once every live player has reported or
//! once the tick has aged past the grace window. Equal digests are discarded
//! silently. A mismatch is reported so the embedder can decide what to do —
//! the oracle itself never ends a match.

use std::collections::BTreeMap;

use super::command::Tick;

/// A confirmed disagreement at one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesyncReport {
    /// The disputed tick.
    pub tick: Tick,
    /// Every submitted digest, by player.
    pub hashes: BTreeMap<String, String>,
}

/// Per-match state-hash collector.
#[derive(Debug)]
pub struct DesyncOracle {
    /// Grace (in ticks) before an incomplete tick is compared anyway, and
    /// the retention bound for uncompared entries.
    window_ticks: u32,
    /// tick → player id → digest.
    hashes: BTreeMap<Tick, BTreeMap<String, String>>,
}

impl DesyncOracle {
    /// Oracle with the given comparison/retention window.
    pub fn new(window_ticks: u32) -> Self {
        Self {
            window_ticks,
            hashes: BTreeMap::new(),
        }
    }

    /// Record a player's digest for a tick. Re-submission overwrites.
    pub fn submit(&mut self, tick: Tick, player_id: &str, hash: impl Into<String>) {
        self.hashes
            .entry(tick)
            .or_default()
            .insert(player_id.to_string(), hash.into());
    }

    /// Compare every tick that is ready: all of `live_players` reported, or
    /// the tick is `window_ticks` behind `current_tick`. Compared entries
    /// are removed; mismatches come back as reports, tick-ascending.
    pub fn check(&mut self, current_tick: Tick, live_players: &[String]) -> Vec<DesyncReport> {
        let mut ready: Vec<Tick> = Vec::new();

        for (&tick, submitted) in &self.hashes {
            if tick > current_tick {
                continue;
            }
            let complete = !live_players.is_empty()
                && live_players.iter().all(|p| submitted.contains_key(p));
            let aged = current_tick.saturating_sub(tick) >= self.window_ticks;
            if complete || aged {
                ready.push(tick);
            }
        }

        let mut reports = Vec::new();
        for tick in ready {
            if let Some(submitted) = self.hashes.remove(&tick) {
                if !Self::unanimous(&submitted) {
                    reports.push(DesyncReport { tick, hashes: submitted });
                }
            }
        }
        reports
    }

    /// Pending (uncompared) tick count.
    pub fn pending(&self) -> usize {
        self.hashes.len()
    }

    fn unanimous(submitted: &BTreeMap<String, String>) -> bool {
        let mut values = submitted.values();
        match values.next() {
            Some(first) => values.all(|h| h == first),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_agreement_is_silent() {
        let mut oracle = DesyncOracle::new(60);
        oracle.submit(5, "p1", "A");
        oracle.submit(5, "p2", "A");

        let reports = oracle.check(5, &live(&["p1", "p2"]));
        assert!(reports.is_empty());
        assert_eq!(oracle.pending(), 0);
    }

    #[test]
    fn test_mismatch_reported_with_all_hashes() {
        let mut oracle = DesyncOracle::new(60);
        oracle.submit(5, "p1", "A");
        oracle.submit(5, "p2", "A");
        oracle.submit(5, "p3", "B");

        let reports = oracle.check(5, &live(&["p1", "p2", "p3"]));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].tick, 5);
        assert_eq!(reports[0].hashes.get("p1").map(String::as_str), Some("A"));
        assert_eq!(reports[0].hashes.get("p3").map(String::as_str), Some("B"));
    }

    #[test]
    fn test_waits_for_all_live_players() {
        let mut oracle = DesyncOracle::new(60);
        oracle.submit(5, "p1", "A");

        assert!(oracle.check(5, &live(&["p1", "p2"])).is_empty());
        assert_eq!(oracle.pending(), 1);

        oracle.submit(5, "p2", "B");
        let reports = oracle.check(5, &live(&["p1", "p2"]));
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn test_aged_tick_compared_without_stragglers() {
        let mut oracle = DesyncOracle::new(10);
        oracle.submit(5, "p1", "A");
        oracle.submit(5, "p2", "B");

        // p3 never reports; the tick is compared once the grace elapses.
        assert!(oracle.check(14, &live(&["p1", "p2", "p3"])).is_empty());
        let reports = oracle.check(15, &live(&["p1", "p2", "p3"]));
        assert_eq!(reports.len(), 1);
        assert_eq!(oracle.pending(), 0);
    }

    #[test]
    fn test_lone_aged_hash_discarded() {
        let mut oracle = DesyncOracle::new(10);
        oracle.submit(5, "p1", "A");

        let reports = oracle.check(20, &live(&["p1", "p2"]));
        assert!(reports.is_empty());
        assert_eq!(oracle.pending(), 0);
    }

    #[test]
    fn test_future_ticks_not_compared() {
        let mut oracle = DesyncOracle::new(10);
        oracle.submit(9, "p1", "A");
        oracle.submit(9, "p2", "B");

        assert!(oracle.check(5, &live(&["p1", "p2"])).is_empty());
        assert_eq!(oracle.pending(), 1);
    }

    #[test]
    fn test_resubmission_overwrites() {
        let mut oracle = DesyncOracle::new(60);
        oracle.submit(5, "p1", "A");
        oracle.submit(5, "p1", "B");
        oracle.submit(5, "p2", "B");

        let reports = oracle.check(5, &live(&["p1", "p2"]));
        assert!(reports.is_empty());
    }

    #[test]
    fn test_disconnected_player_not_awaited() {
        let mut oracle = DesyncOracle::new(60);
        oracle.submit(5, "p1", "A");
        oracle.submit(5, "p2", "A");

        // p3 is disconnected and excluded from the live set.
        let reports = oracle.check(5, &live(&["p1", "p2"]));
        assert!(reports.is_empty());
        assert_eq!(oracle.pending(), 0);
    }
}
