use crate::config::Config;
use crate::crypto::UnitDigest;
use crate::dag::Dag;
use crate::rsource::{permuted_key, RandomSource};
use crate::types::{Level, NodeId, PreBlock};
use crate::unit::Unit;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Vote {
    Popular,
    Unpopular,
    Undecided,
}

/// One committed level: the pre-block to emit plus the unit whose past
/// defines it.
pub struct TimingRound {
    pub level: Level,
    pub timing_unit: Arc<Unit>,
    pub pre_block: PreBlock,
    pub last_of_epoch: bool,
}

/// Chooses a timing unit per level of one epoch's DAG and flattens each
/// timing unit's new past into a pre-block.
///
/// Candidates are judged per creator coordinate through rounds of virtual
/// votes recorded in the DAG structure itself, so any two processes holding
/// enough of the DAG reach the same decision no matter how their local views
/// grew. A level is committed to the first creator, in the level's
/// permutation order, whose candidate is decided popular.
pub struct Extender {
    dag: Arc<Dag>,
    conf: Config,
    rsource: Arc<dyn RandomSource>,
    current_level: Level,
    last_timing: Option<Arc<Unit>>,
    votes: HashMap<(NodeId, Level, UnitDigest), Vote>,
    finished: bool,
}

impl Extender {
    pub fn new(dag: Arc<Dag>, conf: Config, rsource: Arc<dyn RandomSource>) -> Self {
        Self {
            dag,
            conf,
            rsource,
            current_level: 0,
            last_timing: None,
            votes: HashMap::new(),
            finished: false,
        }
    }

    /// True once the level carrying the epoch's last application data has
    /// been committed; nothing further will ever be emitted.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Commits as many levels as the DAG currently supports, in strict level
    /// order.
    pub fn advance(&mut self) -> Vec<TimingRound> {
        let mut rounds = Vec::new();
        while !self.finished {
            let level = self.current_level;
            let timing = match self.decide_level(level) {
                Some(unit) => unit,
                None => break,
            };
            info!(epoch = self.dag.epoch(), level, timing = ?timing, "timing unit decided");
            let pre_block = self.flatten(&timing);
            let last_of_epoch = level == self.conf.last_level;
            rounds.push(TimingRound {
                level,
                timing_unit: timing.clone(),
                pre_block,
                last_of_epoch,
            });
            self.last_timing = Some(timing);
            if last_of_epoch {
                self.finished = true;
            } else {
                self.current_level += 1;
            }
        }
        rounds
    }

    /// Permutation seed for a level, derived from material every correct
    /// process already agrees on: the previous timing unit.
    fn level_seed(&self, level: Level) -> [u8; 32] {
        let prev = self
            .last_timing
            .as_ref()
            .map(|u| u.hash())
            .unwrap_or(UnitDigest::ZERO);
        self.rsource.random_bytes(level, &[prev])
    }

    fn decide_level(&mut self, level: Level) -> Option<Arc<Unit>> {
        let max_level = self.dag.max_level();
        if max_level < level + self.conf.vote_delay + 1 {
            return None;
        }
        let seed = self.level_seed(level);
        let algo = self.conf.digest_algorithm;
        let mut creators: Vec<NodeId> = (0..self.conf.n_proc).collect();
        creators.sort_by_key(|c| permuted_key(&seed, &c.to_le_bytes(), algo));

        for creator in creators {
            match self.decide_candidate(creator, level, max_level) {
                Vote::Popular => {
                    let mut units = self.dag.units_on_level_by(level, creator);
                    // A forked sibling nobody voted for must not win the
                    // permutation, so only candidates below some first-round
                    // voter qualify.
                    let voters = self.dag.units_on_level(level + self.conf.vote_delay);
                    units.retain(|u| voters.iter().any(|v| v.above(u)));
                    let unit = units
                        .into_iter()
                        .min_by_key(|u| permuted_key(&seed, u.hash().as_bytes(), algo));
                    match unit {
                        Some(unit) => return Some(unit),
                        // Decided popular before the unit itself arrived;
                        // wait for it.
                        None => return None,
                    }
                }
                Vote::Unpopular => {
                    trace!(level, creator, "candidate decided unpopular");
                    continue;
                }
                Vote::Undecided => {
                    if max_level - level > self.conf.popularity_cap {
                        debug!(level, creator, "popularity cap reached, falling back");
                        return self.permutation_fallback(level, &seed);
                    }
                    return None;
                }
            }
        }
        // Every candidate was decided unpopular; resolve the level by the
        // permutation alone so the epoch cannot stall.
        self.permutation_fallback(level, &seed)
    }

    fn permutation_fallback(&self, level: Level, seed: &[u8; 32]) -> Option<Arc<Unit>> {
        let algo = self.conf.digest_algorithm;
        self.dag
            .units_on_level(level)
            .into_iter()
            .min_by_key(|u| permuted_key(seed, u.hash().as_bytes(), algo))
    }

    /// Scans the deciding rounds for a unit that settles the candidate.
    fn decide_candidate(&mut self, creator: NodeId, level: Level, max_level: Level) -> Vote {
        let deepest = (max_level - level).min(self.conf.popularity_cap);
        let mut round = self.conf.vote_delay + 1;
        while round <= deepest {
            for v in self.dag.units_on_level(level + round) {
                let decision = self.decide_with(creator, level, &v);
                if decision != Vote::Undecided {
                    return decision;
                }
            }
            round += 1;
        }
        Vote::Undecided
    }

    /// A unit decides a candidate when a quorum of its prime ancestors vote
    /// the common vote of their round.
    fn decide_with(&mut self, creator: NodeId, level: Level, v: &Arc<Unit>) -> Vote {
        let round = v.level() - level;
        if round <= self.conf.vote_delay {
            return Vote::Undecided;
        }
        let common = self.common_vote(round - 1);
        let mut popular = 0usize;
        let mut unpopular = 0usize;
        for ancestor in self.prime_ancestors(v, v.level() - 1) {
            match self.vote(creator, level, &ancestor) {
                Vote::Popular => popular += 1,
                Vote::Unpopular => unpopular += 1,
                Vote::Undecided => {}
            }
        }
        let quorum = self.conf.quorum();
        match common {
            Vote::Popular if popular >= quorum => Vote::Popular,
            Vote::Unpopular if unpopular >= quorum => Vote::Unpopular,
            _ => Vote::Undecided,
        }
    }

    /// The vote of `v` on the candidate coordinate (creator, level). The
    /// first round votes on direct visibility; later rounds take their prime
    /// ancestors' unanimous value, or the common vote on a split.
    fn vote(&mut self, creator: NodeId, level: Level, v: &Arc<Unit>) -> Vote {
        let round = v.level() - level;
        if round < self.conf.vote_delay {
            return Vote::Undecided;
        }
        let key = (creator, level, v.hash());
        if let Some(&cached) = self.votes.get(&key) {
            return cached;
        }
        let result = if round == self.conf.vote_delay {
            // v's past is immutable and fully present, so this is intrinsic
            // to v and safe to cache.
            let seen = self
                .dag
                .units_on_level_by(level, creator)
                .iter()
                .any(|candidate| v.above(candidate));
            if seen {
                Vote::Popular
            } else {
                Vote::Unpopular
            }
        } else {
            let mut popular = 0usize;
            let mut unpopular = 0usize;
            for ancestor in self.prime_ancestors(v, v.level() - 1) {
                match self.vote(creator, level, &ancestor) {
                    Vote::Popular => popular += 1,
                    Vote::Unpopular => unpopular += 1,
                    Vote::Undecided => {}
                }
            }
            if popular > 0 && unpopular == 0 {
                Vote::Popular
            } else if unpopular > 0 && popular == 0 {
                Vote::Unpopular
            } else {
                self.common_vote(round - 1)
            }
        };
        self.votes.insert(key, result);
        result
    }

    /// Deterministic common vote schedule; no coin is needed for finite
    /// epochs. The single unpopular round is what lets absent candidates be
    /// decided against.
    fn common_vote(&self, round: Level) -> Vote {
        if round < self.conf.vote_delay {
            Vote::Undecided
        } else if round == self.conf.vote_delay + 2 {
            Vote::Unpopular
        } else {
            Vote::Popular
        }
    }

    /// One ancestor of `v` per creator at exactly `level`, found by walking
    /// the floor entries down their predecessor chains. Forked ancestors are
    /// collapsed to the smallest hash so every process counts the same vote.
    fn prime_ancestors(&self, v: &Arc<Unit>, level: Level) -> Vec<Arc<Unit>> {
        let mut result = Vec::new();
        for creator in 0..self.conf.n_proc {
            let mut best: Option<Arc<Unit>> = None;
            for head in v.floor(creator) {
                let mut current = Some(head.clone());
                while let Some(unit) = current {
                    if unit.level() <= level {
                        if unit.level() == level
                            && best.as_ref().map_or(true, |b| unit.hash() < b.hash())
                        {
                            best = Some(unit);
                        }
                        break;
                    }
                    current = unit.predecessor().cloned();
                }
            }
            if let Some(unit) = best {
                result.push(unit);
            }
        }
        result
    }

    /// Δ = past(T_L) \ past(T_{L-1}), partitioned by level and ordered by
    /// (permuted creator, hash) within each level. Only units at data levels
    /// contribute payload bytes, but every unit in the batch feeds the
    /// randomness.
    fn flatten(&self, timing: &Arc<Unit>) -> PreBlock {
        let level = self.current_level;
        let seed = self.level_seed(level);
        let algo = self.conf.digest_algorithm;

        let mut batch: Vec<Arc<Unit>> = Vec::new();
        let mut visited: HashSet<UnitDigest> = HashSet::new();
        let mut stack = vec![timing.clone()];
        visited.insert(timing.hash());
        while let Some(unit) = stack.pop() {
            if self
                .last_timing
                .as_ref()
                .map_or(false, |prev| prev.above(&unit))
            {
                continue;
            }
            for parent in unit.parents().iter().flatten() {
                if visited.insert(parent.hash()) {
                    stack.push(parent.clone());
                }
            }
            batch.push(unit);
        }

        let mut order: Vec<NodeId> = (0..self.conf.n_proc).collect();
        order.sort_by_key(|c| permuted_key(&seed, &c.to_le_bytes(), algo));
        let mut rank = vec![0usize; self.conf.n_proc as usize];
        for (i, c) in order.iter().enumerate() {
            rank[*c as usize] = i;
        }
        batch.sort_by_key(|u| (u.level(), rank[u.creator() as usize], u.hash()));

        let data = batch
            .iter()
            .filter(|u| u.height() > 0 && u.level() <= self.conf.last_level && !u.data().is_empty())
            .map(|u| u.data().to_vec())
            .collect();
        let hashes: Vec<UnitDigest> = batch.iter().map(|u| u.hash()).collect();
        let random_bytes = self.rsource.random_bytes(level, &hashes);
        debug!(
            epoch = self.dag.epoch(),
            level,
            units = batch.len(),
            "flattened timing round"
        );
        PreBlock { data, random_bytes }
    }
}
