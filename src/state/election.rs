//! Master Election
//!
//! Periodic rounds over the active peer set pick one master. Candidates are
//! ranked by configured priority (lower wins) and ties are broken by a
//! pseudo-random choice seeded from the tied set and the round epoch, so
//! every node that sees the same set in the same epoch picks the same peer
//! without exchanging votes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use crate::registry::PeerId;
use crate::state::MembershipDirectory;

/// Result of one election round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResult {
    pub winner: PeerId,
    pub epoch: u64,
    /// Whether the winner differs from the previously held master
    pub changed: bool,
}

#[derive(Debug, Default)]
struct ElectionState {
    current_master: Option<PeerId>,
    epoch: u64,
    last_election_at: Option<Instant>,
    manual_master: bool,
    /// Peer forced by a `ForceMaster`, kept while it stays active
    override_master: Option<PeerId>,
}

/// Election coordinator
pub struct ElectionCoordinator {
    self_id: PeerId,
    directory: Arc<MembershipDirectory>,
    priorities: HashMap<PeerId, u32>,
    cooldown: Duration,
    state: Mutex<ElectionState>,
}

/// Pick the round winner among `candidates` for `epoch`
///
/// Depends only on the sorted candidate set and the epoch.
pub fn choose_winner<'a, I>(candidates: I, epoch: u64) -> Option<PeerId>
where
    I: IntoIterator<Item = &'a PeerId>,
{
    let sorted: Vec<&PeerId> = candidates
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let blob = serde_json::json!({ "candidates": sorted, "epoch": epoch }).to_string();
    let digest = Sha256::digest(blob.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    let mut rng = StdRng::from_seed(seed);

    sorted.choose(&mut rng).map(|p| (*p).clone())
}

impl ElectionCoordinator {
    pub fn new(
        self_id: impl Into<PeerId>,
        directory: Arc<MembershipDirectory>,
        priorities: HashMap<PeerId, u32>,
        cooldown: Duration,
        manual_master: bool,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            directory,
            priorities,
            cooldown,
            state: Mutex::new(ElectionState {
                manual_master,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ElectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured priority, or one past the worst configured value
    pub fn priority_of(&self, peer: &str) -> u32 {
        match self.priorities.get(peer) {
            Some(p) => *p,
            None => self.priorities.values().copied().max().unwrap_or(0).saturating_add(1),
        }
    }

    pub fn current_master(&self) -> Option<PeerId> {
        self.state().current_master.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state().epoch
    }

    pub fn is_manual_master(&self) -> bool {
        self.state().manual_master
    }

    pub fn set_manual_master(&self, manual: bool) {
        self.state().manual_master = manual;
    }

    /// Peer currently pinned by a manual override
    pub fn override_master(&self) -> Option<PeerId> {
        self.state().override_master.clone()
    }

    /// Run a round now
    pub fn run_round(&self) -> Option<RoundResult> {
        self.run_round_at(Instant::now())
    }

    /// Run a round at `now`; `None` while the cooldown is in effect
    pub fn run_round_at(&self, now: Instant) -> Option<RoundResult> {
        let mut state = self.state();

        if let Some(last) = state.last_election_at {
            if now.saturating_duration_since(last) < self.cooldown {
                return None;
            }
        }

        state.epoch += 1;
        let epoch = state.epoch;

        if let Some(forced) = state.override_master.clone() {
            if !self.directory.is_active_at(&forced, now) {
                tracing::info!("Override master {} is no longer active, dropping override", forced);
                state.override_master = None;
            }
        }

        let winner = if state.manual_master {
            self.self_id.clone()
        } else if let Some(forced) = state.override_master.clone() {
            forced
        } else {
            let active = self.directory.active_peers_at(now);
            let best = active.iter().map(|p| self.priority_of(p)).min()?;
            let top: Vec<&PeerId> = active.iter().filter(|p| self.priority_of(p) == best).collect();
            choose_winner(top, epoch)?
        };

        let changed = state.current_master.as_deref() != Some(winner.as_str());
        state.current_master = Some(winner.clone());
        state.last_election_at = Some(now);

        if changed {
            tracing::info!("Elected master {} (epoch {})", winner, epoch);
        } else {
            tracing::debug!("Master {} confirmed (epoch {})", winner, epoch);
        }

        Some(RoundResult { winner, epoch, changed })
    }

    /// Handle a `master` announcement; returns whether it was adopted
    pub fn on_announcement(&self, master: &str) -> bool {
        self.on_announcement_at(master, Instant::now())
    }

    pub fn on_announcement_at(&self, master: &str, now: Instant) -> bool {
        let mut state = self.state();

        let held = match state.current_master.as_deref() {
            Some(current) if current == master => return false,
            Some(current) => Some(self.priority_of(current)),
            None => None,
        };

        let within_cooldown = state
            .last_election_at
            .map(|last| now.saturating_duration_since(last) < self.cooldown)
            .unwrap_or(false);

        let accept = within_cooldown
            || match held {
                None => true,
                Some(held) => self.priority_of(master) < held,
            };

        if accept {
            tracing::info!("Synchronized master update: {}", master);
            state.current_master = Some(master.to_string());
        }
        accept
    }

    /// Handle a peer leaving; returns whether it was the master
    ///
    /// Clears the cooldown when the master leaves so the next round
    /// re-elects immediately.
    pub fn on_leave(&self, peer: &str) -> bool {
        self.directory.forget(peer);

        let mut state = self.state();
        if state.override_master.as_deref() == Some(peer) {
            state.override_master = None;
        }
        if state.current_master.as_deref() == Some(peer) {
            tracing::info!("Master {} left, re-electing on next round", peer);
            state.current_master = None;
            state.last_election_at = None;
            true
        } else {
            false
        }
    }

    /// Take `master` from a join answer; starts a cooldown window
    pub fn adopt(&self, master: &str) {
        let mut state = self.state();
        state.current_master = Some(master.to_string());
        state.last_election_at = Some(Instant::now());
    }

    /// Pin `master` as the winner of future rounds (manual override)
    pub fn force(&self, master: &str) {
        let mut state = self.state();
        tracing::info!("Manual override: master is now {}", master);
        state.override_master = Some(master.to_string());
        state.current_master = Some(master.to_string());
        state.last_election_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(10);

    fn coordinator(self_id: &str, peers: &[&str], priorities: &[(&str, u32)]) -> ElectionCoordinator {
        let directory = Arc::new(MembershipDirectory::new(self_id, Duration::from_secs(30)));
        for peer in peers {
            directory.record(peer);
        }
        let priorities = priorities.iter().map(|(p, v)| (p.to_string(), *v)).collect();
        ElectionCoordinator::new(self_id, directory, priorities, COOLDOWN, false)
    }

    fn ids(peers: &[&str]) -> Vec<PeerId> {
        peers.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_choose_winner_is_order_independent() {
        let forward = ids(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let reversed: Vec<PeerId> = forward.iter().rev().cloned().collect();

        for epoch in 1..50 {
            let a = choose_winner(&forward, epoch).unwrap();
            let b = choose_winner(&reversed, epoch).unwrap();
            assert_eq!(a, b);
            assert!(forward.contains(&a));
        }
        assert!(choose_winner(&Vec::<PeerId>::new(), 1).is_none());
    }

    #[test]
    fn test_choose_winner_varies_with_epoch() {
        let candidates = ids(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        let winners: BTreeSet<PeerId> = (1..64)
            .filter_map(|epoch| choose_winner(&candidates, epoch))
            .collect();
        assert!(winners.len() > 1);
    }

    #[test]
    fn test_priority_defaults() {
        let c = coordinator("10.0.0.1", &[], &[("10.0.0.1", 1), ("10.0.0.2", 3)]);
        assert_eq!(c.priority_of("10.0.0.1"), 1);
        assert_eq!(c.priority_of("10.0.0.9"), 4);

        let unconfigured = coordinator("10.0.0.1", &[], &[]);
        assert_eq!(unconfigured.priority_of("10.0.0.1"), unconfigured.priority_of("10.0.0.2"));
    }

    #[test]
    fn test_best_priority_wins_everywhere() {
        let peers = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
        let priorities = [("10.0.0.1", 1), ("10.0.0.2", 1), ("10.0.0.3", 2)];

        let now = Instant::now();
        let results: Vec<RoundResult> = peers
            .iter()
            .map(|me| {
                let others: Vec<&str> = peers.iter().copied().filter(|p| p != me).collect();
                coordinator(me, &others, &priorities).run_round_at(now).unwrap()
            })
            .collect();

        // Same epoch and same tied set on every node
        assert!(results.iter().all(|r| r == &results[0]));
        assert_ne!(results[0].winner, "10.0.0.3");
        assert!(results[0].changed);
    }

    #[test]
    fn test_scenario_priority_convergence_and_failover() {
        // A=1, B=2, C=3: every node must pick A, and B after A leaves
        let a = "10.0.0.1";
        let b = "10.0.0.2";
        let c = "10.0.0.3";
        let priorities = [(a, 1), (b, 2), (c, 3)];
        let start = Instant::now();

        let node_b = coordinator(b, &[a, c], &priorities);
        let node_c = coordinator(c, &[a, b], &priorities);
        assert_eq!(node_b.run_round_at(start).unwrap().winner, a);
        assert_eq!(node_c.run_round_at(start).unwrap().winner, a);

        assert!(node_b.on_leave(a));
        assert!(node_c.on_leave(a));

        // Cooldown cleared, so the very next tick re-elects
        let next = start + Duration::from_secs(2);
        assert_eq!(node_b.run_round_at(next).unwrap().winner, b);
        assert_eq!(node_c.run_round_at(next).unwrap().winner, b);
    }

    #[test]
    fn test_cooldown_skips_rounds() {
        let c = coordinator("10.0.0.1", &[], &[]);
        let start = Instant::now();
        assert!(c.run_round_at(start).is_some());
        assert!(c.run_round_at(start + Duration::from_secs(2)).is_none());
        assert_eq!(c.epoch(), 1);

        let later = c.run_round_at(start + COOLDOWN).unwrap();
        assert_eq!(later.epoch, 2);
        assert!(!later.changed);
    }

    #[test]
    fn test_announcement_acceptance() {
        let priorities = [("10.0.0.1", 1), ("10.0.0.2", 2), ("10.0.0.3", 3)];
        let c = coordinator("10.0.0.2", &["10.0.0.1", "10.0.0.3"], &priorities);
        let start = Instant::now();

        // No master held yet
        assert!(c.on_announcement_at("10.0.0.3", start));
        assert!(!c.on_announcement_at("10.0.0.3", start));

        // Outside cooldown only strictly better priority is adopted
        assert!(c.on_announcement_at("10.0.0.2", start));
        assert_eq!(c.current_master().as_deref(), Some("10.0.0.2"));
        assert!(!c.on_announcement_at("10.0.0.3", start));
        assert!(c.on_announcement_at("10.0.0.1", start));

        // Within cooldown anything different is adopted
        c.run_round_at(start);
        assert_eq!(c.current_master().as_deref(), Some("10.0.0.1"));
        assert!(c.on_announcement_at("10.0.0.3", start + Duration::from_secs(1)));
    }

    #[test]
    fn test_adopted_master_starts_cooldown() {
        let c = coordinator("10.0.0.4", &["10.0.0.1"], &[("10.0.0.4", 1), ("10.0.0.1", 2)]);
        c.adopt("10.0.0.1");

        assert_eq!(c.current_master().as_deref(), Some("10.0.0.1"));
        assert!(c.run_round().is_none());
        assert!(c.on_announcement("10.0.0.7"));
    }

    #[test]
    fn test_manual_master_wins_own_rounds() {
        let c = coordinator("10.0.0.3", &["10.0.0.1"], &[("10.0.0.1", 1), ("10.0.0.3", 9)]);
        c.set_manual_master(true);
        assert_eq!(c.run_round().unwrap().winner, "10.0.0.3");
    }

    #[test]
    fn test_override_is_sticky_until_peer_leaves() {
        let c = coordinator("10.0.0.1", &["10.0.0.5"], &[("10.0.0.1", 1)]);
        let start = Instant::now();

        c.force("10.0.0.5");
        let later = start + COOLDOWN + Duration::from_secs(1);
        assert_eq!(c.run_round_at(later).unwrap().winner, "10.0.0.5");

        assert!(c.on_leave("10.0.0.5"));
        assert!(c.override_master().is_none());
        assert_eq!(c.run_round_at(later).unwrap().winner, "10.0.0.1");
    }
}
