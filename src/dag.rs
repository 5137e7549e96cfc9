use crate::crown::combined_hash;
use crate::crypto::{DigestAlgorithm, UnitDigest};
use crate::types::{Epoch, Height, Level, NodeId};
use crate::unit::{unit_id, PreUnit, Unit};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on the parent combinations tried when forked coordinates make
/// a crown ambiguous.
const MAX_FORK_COMBINATIONS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("unit of epoch {got} offered to the DAG of epoch {expected}")]
    WrongEpoch { expected: Epoch, got: Epoch },
    #[error("creator {0} out of committee range")]
    CreatorOutOfRange(NodeId),
    #[error("crown disagrees with the unit coordinates")]
    InconsistentCrown,
    #[error("bad height {height} for a unit by {creator}")]
    BadHeight { creator: NodeId, height: Height },
    #[error("non-dealing unit carries {0} parents, below quorum")]
    TooFewParents(usize),
    #[error("no parent combination matches the control hash")]
    ControlHashMismatch,
}

/// Result of offering a pre-unit to the DAG. Units with absent parents are
/// handed back rather than buffered here; retrying is the caller's concern.
pub enum AddOutcome {
    Added(Arc<Unit>),
    Duplicate,
    MissingParents(PreUnit, Vec<u64>),
    Invalid(DagError),
}

enum ResolveFailure {
    Missing(Vec<u64>),
    Invalid(DagError),
}

pub type Observer = Box<dyn Fn(&Arc<Unit>) + Send + Sync>;

/// Append-only store of the units of one epoch. Resolves parents by
/// (creator, height), computes levels and floors, detects forks, and fires
/// post-insert observers synchronously under its lock so derived state is
/// always consistent with DAG contents. Observers must only enqueue.
pub struct Dag {
    epoch: Epoch,
    n_proc: u16,
    quorum: usize,
    algo: DigestAlgorithm,
    inner: Mutex<DagInner>,
}

#[derive(Default)]
struct DagInner {
    units: HashMap<UnitDigest, Arc<Unit>>,
    by_coord: HashMap<(NodeId, Height), Vec<Arc<Unit>>>,
    by_level: HashMap<Level, Vec<Arc<Unit>>>,
    max_level: Level,
    forkers: HashSet<NodeId>,
    observers: Vec<Observer>,
}

impl Dag {
    pub fn new(epoch: Epoch, n_proc: u16, quorum: usize, algo: DigestAlgorithm) -> Self {
        Self {
            epoch,
            n_proc,
            quorum,
            algo,
            inner: Mutex::new(DagInner {
                max_level: -1,
                ..Default::default()
            }),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum
    }

    /// Inserts an externally received pre-unit, resolving its parents from
    /// the crown. The whole add fails if any referenced parent is unknown.
    pub fn add(&self, pre: PreUnit) -> AddOutcome {
        if pre.epoch() != self.epoch {
            return AddOutcome::Invalid(DagError::WrongEpoch {
                expected: self.epoch,
                got: pre.epoch(),
            });
        }
        if pre.creator() >= self.n_proc {
            return AddOutcome::Invalid(DagError::CreatorOutOfRange(pre.creator()));
        }
        if pre.crown().n_proc() != self.n_proc as usize {
            return AddOutcome::Invalid(DagError::InconsistentCrown);
        }
        if pre.height() < 0 {
            return AddOutcome::Invalid(DagError::BadHeight {
                creator: pre.creator(),
                height: pre.height(),
            });
        }
        if pre.dealing() {
            if pre.crown().parent_count() != 0 {
                return AddOutcome::Invalid(DagError::InconsistentCrown);
            }
        } else {
            if pre.crown().height_of(pre.creator()) != Some(pre.height() - 1) {
                return AddOutcome::Invalid(DagError::InconsistentCrown);
            }
            if pre.crown().parent_count() < self.quorum {
                return AddOutcome::Invalid(DagError::TooFewParents(
                    pre.crown().parent_count(),
                ));
            }
        }

        let mut inner = self.inner.lock();
        if inner.units.contains_key(&pre.hash()) {
            return AddOutcome::Duplicate;
        }

        let parents = match self.resolve_parents(&inner, &pre) {
            Ok(parents) => parents,
            Err(ResolveFailure::Missing(ids)) => {
                drop(inner);
                return AddOutcome::MissingParents(pre, ids);
            }
            Err(ResolveFailure::Invalid(error)) => return AddOutcome::Invalid(error),
        };

        let unit = Unit::from_parents(pre, parents, self.quorum);
        self.insert_locked(&mut inner, unit.clone());
        AddOutcome::Added(unit)
    }

    /// Inserts a locally created, already situated unit. Its parents are
    /// guaranteed to be this DAG's own records, so only indexing and fork
    /// detection remain.
    pub fn insert(&self, unit: Arc<Unit>) -> AddOutcome {
        if unit.epoch() != self.epoch {
            return AddOutcome::Invalid(DagError::WrongEpoch {
                expected: self.epoch,
                got: unit.epoch(),
            });
        }
        let mut inner = self.inner.lock();
        if inner.units.contains_key(&unit.hash()) {
            return AddOutcome::Duplicate;
        }
        self.insert_locked(&mut inner, unit.clone());
        AddOutcome::Added(unit)
    }

    fn insert_locked(&self, inner: &mut DagInner, unit: Arc<Unit>) {
        let coord = (unit.creator(), unit.height());
        let siblings = inner.by_coord.entry(coord).or_default();
        siblings.push(unit.clone());
        if siblings.len() > 1 && inner.forkers.insert(unit.creator()) {
            warn!(
                creator = unit.creator(),
                height = unit.height(),
                epoch = self.epoch,
                "fork detected"
            );
        }
        inner.by_level.entry(unit.level()).or_default().push(unit.clone());
        inner.max_level = inner.max_level.max(unit.level());
        inner.units.insert(unit.hash(), unit.clone());
        debug!(unit = ?unit, epoch = self.epoch, "unit added");

        for observer in &inner.observers {
            observer(&unit);
        }
    }

    /// Looks up each non-absent crown slot at (creator, crown height). When a
    /// fork makes a slot ambiguous the combinations are tried against the
    /// control hash.
    fn resolve_parents(
        &self,
        inner: &DagInner,
        pre: &PreUnit,
    ) -> Result<Vec<Option<Arc<Unit>>>, ResolveFailure> {
        let mut slots: Vec<Option<Vec<Arc<Unit>>>> = Vec::with_capacity(self.n_proc as usize);
        let mut missing = Vec::new();
        for c in 0..self.n_proc {
            match pre.crown().height_of(c) {
                None => slots.push(None),
                Some(height) => match inner.by_coord.get(&(c, height)) {
                    Some(units) if !units.is_empty() => slots.push(Some(units.clone())),
                    _ => {
                        missing.push(unit_id(height, c, self.epoch));
                        slots.push(Some(Vec::new()));
                    }
                },
            }
        }
        if !missing.is_empty() {
            return Err(ResolveFailure::Missing(missing));
        }

        let combinations: usize = slots
            .iter()
            .flatten()
            .map(|candidates| candidates.len())
            .product();
        if combinations > MAX_FORK_COMBINATIONS {
            return Err(ResolveFailure::Invalid(DagError::ControlHashMismatch));
        }

        for combo in 0..combinations {
            let mut choice = combo;
            let parents: Vec<Option<Arc<Unit>>> = slots
                .iter()
                .map(|slot| {
                    slot.as_ref().map(|candidates| {
                        let picked = candidates[choice % candidates.len()].clone();
                        choice /= candidates.len();
                        picked
                    })
                })
                .collect();
            let control = combined_hash(
                parents
                    .iter()
                    .map(|p| p.as_ref().map(|u| u.hash()).unwrap_or(UnitDigest::ZERO)),
                self.algo,
            );
            if control == *pre.crown().control_hash() {
                return Ok(parents);
            }
        }
        Err(ResolveFailure::Invalid(DagError::ControlHashMismatch))
    }

    pub fn unit(&self, hash: &UnitDigest) -> Option<Arc<Unit>> {
        self.inner.lock().units.get(hash).cloned()
    }

    pub fn contains(&self, hash: &UnitDigest) -> bool {
        self.inner.lock().units.contains_key(hash)
    }

    /// All units at the given coordinates; more than one only under a fork.
    pub fn units_on(&self, creator: NodeId, height: Height) -> Vec<Arc<Unit>> {
        self.inner
            .lock()
            .by_coord
            .get(&(creator, height))
            .cloned()
            .unwrap_or_default()
    }

    /// Units at a level, ordered by (creator, hash) so iteration is the same
    /// on every process holding the same units.
    pub fn units_on_level(&self, level: Level) -> Vec<Arc<Unit>> {
        let mut units = self
            .inner
            .lock()
            .by_level
            .get(&level)
            .cloned()
            .unwrap_or_default();
        units.sort_by_key(|u| (u.creator(), u.hash()));
        units
    }

    pub fn units_on_level_by(&self, level: Level, creator: NodeId) -> Vec<Arc<Unit>> {
        let mut units: Vec<_> = self
            .inner
            .lock()
            .by_level
            .get(&level)
            .map(|units| {
                units
                    .iter()
                    .filter(|u| u.creator() == creator)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        units.sort_by_key(|u| u.hash());
        units
    }

    pub fn max_level(&self) -> Level {
        self.inner.lock().max_level
    }

    pub fn is_forker(&self, creator: NodeId) -> bool {
        self.inner.lock().forkers.contains(&creator)
    }

    pub fn unit_count(&self) -> usize {
        self.inner.lock().units.len()
    }

    /// Registers a post-insert listener, invoked synchronously under the DAG
    /// lock for every subsequently added unit.
    pub fn add_observer(&self, observer: Observer) {
        self.inner.lock().observers.push(observer);
    }
}
