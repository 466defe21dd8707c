//! The unchoke selector: decides which interested peers get one of the
//! limited upload slots each choke cycle, and rotates the optimistic slots
//! on their own, slower cycle.

use std::{collections::HashSet, net::SocketAddr, time::Instant};

use rand::seq::SliceRandom;

use crate::conf::{ChokingAlgorithm, SessionConf};

/// With the rate based algorithm a peer earns a slot by uploading to us
/// faster than this base threshold, scaled up by each already granted slot.
const RATE_THRESHOLD_STEP: u64 = 1024;

/// A snapshot of one eligible peer, gathered by the session before a cycle.
/// Candidates are pre-filtered: interested in us, operational, not
/// disconnecting, torrent not paused.
#[derive(Clone, Debug)]
pub(crate) struct ChokeCandidate {
    pub addr: SocketAddr,
    /// The rate at which this peer uploads to us, in bytes per second.
    pub download_rate: u64,
    /// The rate at which we upload to this peer, in bytes per second.
    pub upload_rate: u64,
    /// The estimated rate at which the peer reciprocates when unchoked
    /// (used by the BitTyrant algorithm).
    pub est_reciprocation_rate: u64,
    /// When the peer last held an optimistic slot, if ever.
    pub last_optimistic_unchoke: Option<Instant>,
}

/// The slot changes one cycle decided on.
#[derive(Debug, Default)]
pub(crate) struct ChokeDecision {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

/// Runs the configured choking algorithm over candidate snapshots. The
/// choker owns the current slot assignment; the session applies the
/// decisions to the peer connections.
pub(crate) struct Choker {
    algorithm: ChokingAlgorithm,
    slots_limit: usize,
    optimistic_slots: usize,
    /// The current slot count of the auto-expanding algorithm.
    auto_slots: usize,
    /// Peers holding a regular slot.
    unchoked: HashSet<SocketAddr>,
    /// Peers holding an optimistic slot.
    optimistic: Vec<SocketAddr>,
}

impl Choker {
    pub fn new(conf: &SessionConf) -> Self {
        Self {
            algorithm: conf.choking_algorithm,
            slots_limit: conf.unchoke_slots_limit,
            optimistic_slots: conf.resolved_optimistic_slots(),
            auto_slots: conf.unchoke_slots_limit,
            unchoked: HashSet::new(),
            optimistic: Vec::new(),
        }
    }

    /// The number of peers currently unchoked by us (regular plus
    /// optimistic).
    pub fn unchoked_count(&self) -> usize {
        self.unchoked.len() + self.optimistic.len()
    }

    pub fn is_unchoked(&self, addr: &SocketAddr) -> bool {
        self.unchoked.contains(addr) || self.optimistic.contains(addr)
    }

    pub fn is_optimistic(&self, addr: &SocketAddr) -> bool {
        self.optimistic.contains(addr)
    }

    /// Forgets a departed peer.
    pub fn remove_peer(&mut self, addr: &SocketAddr) {
        self.unchoked.remove(addr);
        self.optimistic.retain(|a| a != addr);
    }

    /// Runs the regular choke cycle: computes the allowed slot count per
    /// the active algorithm, fills the regular slots from the sorted
    /// candidates and chokes everyone falling out of the set.
    ///
    /// `upload_rate` and `upload_queued` describe the session's current
    /// upload link utilization (used by the auto-expanding algorithm).
    pub fn rechoke(
        &mut self,
        candidates: &[ChokeCandidate],
        upload_rate: u64,
        upload_rate_limit: u32,
        upload_queued: usize,
    ) -> ChokeDecision {
        let mut candidates: Vec<&ChokeCandidate> = candidates.iter().collect();
        // random shuffle first so that sorting ties are broken fairly
        candidates.shuffle(&mut rand::thread_rng());

        let allowed = self.allowed_upload_slots(
            &mut candidates,
            upload_rate,
            upload_rate_limit,
            upload_queued,
        );
        let regular_slots = allowed.saturating_sub(self.optimistic.len());

        // drop optimistic entries that are no longer candidates
        let eligible: HashSet<SocketAddr> =
            candidates.iter().map(|c| c.addr).collect();
        self.optimistic.retain(|addr| eligible.contains(addr));

        let new_set: HashSet<SocketAddr> = candidates
            .iter()
            .filter(|c| !self.is_optimistic(&c.addr))
            .take(regular_slots)
            .map(|c| c.addr)
            .collect();

        let mut decision = ChokeDecision::default();
        for addr in &self.unchoked {
            if !new_set.contains(addr) {
                decision.choke.push(*addr);
            }
        }
        for addr in &new_set {
            if !self.unchoked.contains(addr) {
                decision.unchoke.push(*addr);
            }
        }
        self.unchoked = new_set;
        debug_assert!(self.unchoked_count() <= allowed.max(self.optimistic.len()));
        decision
    }

    /// Runs the optimistic rotation: grants the optimistic slots to the
    /// candidates that have waited the longest since their last optimistic
    /// unchoke (peers never unchoked optimistically come first).
    pub fn optimistic_rechoke(
        &mut self,
        candidates: &[ChokeCandidate],
    ) -> ChokeDecision {
        let mut eligible: Vec<&ChokeCandidate> = candidates
            .iter()
            .filter(|c| !self.unchoked.contains(&c.addr))
            .collect();
        eligible.shuffle(&mut rand::thread_rng());
        // None sorts before any timestamp: never-unchoked peers go first
        eligible.sort_by_key(|c| c.last_optimistic_unchoke);

        let new_optimistic: Vec<SocketAddr> = eligible
            .iter()
            .take(self.optimistic_slots)
            .map(|c| c.addr)
            .collect();

        let mut decision = ChokeDecision::default();
        for addr in &self.optimistic {
            if !new_optimistic.contains(addr) {
                decision.choke.push(*addr);
            }
        }
        for addr in &new_optimistic {
            if !self.optimistic.contains(addr) {
                decision.unchoke.push(*addr);
            }
        }
        self.optimistic = new_optimistic;
        decision
    }

    /// Computes the allowed number of upload slots and sorts the candidates
    /// into unchoke preference order, per the active algorithm.
    fn allowed_upload_slots(
        &mut self,
        candidates: &mut Vec<&ChokeCandidate>,
        upload_rate: u64,
        upload_rate_limit: u32,
        upload_queued: usize,
    ) -> usize {
        match self.algorithm {
            ChokingAlgorithm::FixedSlots => {
                sort_by_download_rate(candidates);
                self.slots_limit
            }
            ChokingAlgorithm::AutoExpand => {
                sort_by_download_rate(candidates);
                // expand while the upload link is not saturated but all
                // slots are taken; contract back towards the baseline
                // otherwise
                let limit = u64::from(upload_rate_limit);
                if limit > 0
                    && upload_rate < limit * 9 / 10
                    && upload_queued < 2
                    && self.unchoked_count() >= self.auto_slots
                {
                    self.auto_slots += 1;
                } else if self.auto_slots > self.slots_limit {
                    self.auto_slots -= 1;
                }
                self.auto_slots
            }
            ChokingAlgorithm::RateBased => {
                sort_by_download_rate(candidates);
                let mut slots = 0;
                let mut threshold = RATE_THRESHOLD_STEP;
                for c in candidates.iter() {
                    if c.download_rate < threshold {
                        break;
                    }
                    slots += 1;
                    threshold += RATE_THRESHOLD_STEP;
                }
                slots.max(2)
            }
            ChokingAlgorithm::BitTyrant => {
                // prefer peers that give the most per byte of upload we
                // spend on them
                candidates.sort_by(|a, b| {
                    let a_ratio = ratio(a.download_rate, a.est_reciprocation_rate);
                    let b_ratio = ratio(b.download_rate, b.est_reciprocation_rate);
                    b_ratio.cmp(&a_ratio)
                });
                let budget = if upload_rate_limit > 0 {
                    u64::from(upload_rate_limit)
                } else {
                    upload_rate.max(RATE_THRESHOLD_STEP * 16)
                };
                let mut spent = 0;
                let mut slots = 0;
                for c in candidates.iter() {
                    let cost = c.est_reciprocation_rate.max(1);
                    if spent + cost > budget {
                        break;
                    }
                    spent += cost;
                    slots += 1;
                }
                slots.max(1)
            }
        }
    }
}

fn sort_by_download_rate(candidates: &mut Vec<&ChokeCandidate>) {
    candidates.sort_by(|a, b| b.download_rate.cmp(&a.download_rate));
}

/// Scaled integer ratio used for BitTyrant ordering.
fn ratio(give: u64, take: u64) -> u64 {
    give * 1000 / take.max(1)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn candidate(port: u16, download_rate: u64) -> ChokeCandidate {
        ChokeCandidate {
            addr: addr(port),
            download_rate,
            upload_rate: 0,
            est_reciprocation_rate: 1000,
            last_optimistic_unchoke: None,
        }
    }

    fn conf(algorithm: ChokingAlgorithm, slots: usize) -> SessionConf {
        let mut conf = SessionConf::default();
        conf.choking_algorithm = algorithm;
        conf.unchoke_slots_limit = slots;
        conf.num_optimistic_unchoke_slots = 1;
        conf
    }

    #[test]
    fn test_fixed_slots_cardinality_and_order() {
        let conf = conf(ChokingAlgorithm::FixedSlots, 3);
        let mut choker = Choker::new(&conf);
        let candidates: Vec<ChokeCandidate> = (0..6)
            .map(|i| candidate(7000 + i, u64::from(i) * 1000))
            .collect();

        let decision = choker.rechoke(&candidates, 0, 0, 0);
        // one slot is reserved for the optimistic cycle once it's in use;
        // with no optimistic peer yet, all three regular slots fill up
        assert_eq!(decision.unchoke.len(), 3);
        assert_eq!(choker.unchoked_count(), 3);
        // the fastest uploaders got the slots
        for port in [7005, 7004, 7003] {
            assert!(choker.is_unchoked(&addr(port)), "peer {}", port);
        }

        // a new fast peer displaces the slowest unchoked one
        let mut candidates = candidates;
        candidates.push(candidate(7010, 99_000));
        let decision = choker.rechoke(&candidates, 0, 0, 0);
        assert_eq!(decision.unchoke, vec![addr(7010)]);
        assert_eq!(decision.choke, vec![addr(7003)]);
        assert_eq!(choker.unchoked_count(), 3);
    }

    #[test]
    fn test_choke_cycle_is_stable_without_changes() {
        let conf = conf(ChokingAlgorithm::FixedSlots, 2);
        let mut choker = Choker::new(&conf);
        let candidates =
            vec![candidate(7000, 5000), candidate(7001, 1000)];
        let first = choker.rechoke(&candidates, 0, 0, 0);
        assert_eq!(first.unchoke.len(), 2);
        let second = choker.rechoke(&candidates, 0, 0, 0);
        assert!(second.unchoke.is_empty());
        assert!(second.choke.is_empty());
    }

    #[test]
    fn test_rate_based_slot_count() {
        let conf = conf(ChokingAlgorithm::RateBased, 8);
        let mut choker = Choker::new(&conf);
        // thresholds: 1024, 2048, 3072, ...
        let candidates = vec![
            candidate(7000, 10_000),
            candidate(7001, 5_000),
            candidate(7002, 3_000),
            candidate(7003, 500),
            candidate(7004, 100),
        ];
        choker.rechoke(&candidates, 0, 0, 0);
        // 10000 and 5000 qualify; 3000 misses the 3072 threshold
        assert_eq!(choker.unchoked_count(), 2);
    }

    #[test]
    fn test_bittyrant_respects_upload_budget() {
        let conf = conf(ChokingAlgorithm::BitTyrant, 8);
        let mut choker = Choker::new(&conf);
        let candidates: Vec<ChokeCandidate> = (0..6)
            .map(|i| candidate(7000 + i, 1000 + u64::from(i)))
            .collect();
        // each peer reciprocates an estimated 1000 B/s; a 3500 B/s budget
        // affords three slots
        choker.rechoke(&candidates, 0, 3500, 0);
        assert_eq!(choker.unchoked_count(), 3);
    }

    #[test]
    fn test_auto_expand_grows_when_unsaturated() {
        let conf = conf(ChokingAlgorithm::AutoExpand, 2);
        let mut choker = Choker::new(&conf);
        let candidates: Vec<ChokeCandidate> = (0..6)
            .map(|i| candidate(7000 + i, u64::from(i) * 1000))
            .collect();

        // saturate the baseline slots
        choker.rechoke(&candidates, 100_000, 100_000, 0);
        assert_eq!(choker.unchoked_count(), 2);

        // upload rate well under the limit with free queue: grow
        choker.rechoke(&candidates, 10_000, 100_000, 0);
        assert_eq!(choker.unchoked_count(), 3);

        // saturated again: shrink back towards the baseline
        choker.rechoke(&candidates, 100_000, 100_000, 5);
        assert_eq!(choker.unchoked_count(), 2);
    }

    #[test]
    fn test_optimistic_rotation_prefers_never_unchoked() {
        let conf = conf(ChokingAlgorithm::FixedSlots, 4);
        let mut choker = Choker::new(&conf);
        let now = Instant::now();

        let mut old = candidate(7000, 0);
        old.last_optimistic_unchoke = Some(now - Duration::from_secs(600));
        let mut recent = candidate(7001, 0);
        recent.last_optimistic_unchoke = Some(now - Duration::from_secs(5));
        let fresh = candidate(7002, 0);

        let decision =
            choker.optimistic_rechoke(&[old, recent, fresh.clone()]);
        assert_eq!(decision.unchoke, vec![fresh.addr]);
        assert!(choker.is_optimistic(&fresh.addr));

        // the regular cycle leaves the optimistic slot alone
        let candidates = vec![
            candidate(7000, 1000),
            candidate(7001, 2000),
            fresh.clone(),
        ];
        let decision = choker.rechoke(&candidates, 0, 0, 0);
        assert!(choker.is_optimistic(&fresh.addr));
        assert!(!decision.choke.contains(&fresh.addr));
    }

    #[test]
    fn test_remove_peer_frees_slot() {
        let conf = conf(ChokingAlgorithm::FixedSlots, 2);
        let mut choker = Choker::new(&conf);
        let candidates =
            vec![candidate(7000, 5000), candidate(7001, 1000)];
        choker.rechoke(&candidates, 0, 0, 0);
        assert_eq!(choker.unchoked_count(), 2);

        choker.remove_peer(&addr(7000));
        assert_eq!(choker.unchoked_count(), 1);
        assert!(!choker.is_unchoked(&addr(7000)));
    }
}
