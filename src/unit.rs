use crate::crown::Crown;
use crate::crypto::{DigestAlgorithm, UnitDigest};
use crate::types::{Epoch, Height, Level, NodeId};
use std::fmt;
use std::sync::Arc;

/// Packs (height, creator, epoch) into the 64-bit unit id. Heights and
/// creators occupy 16 bits each, the epoch the upper 32.
pub fn unit_id(height: Height, creator: NodeId, epoch: Epoch) -> u64 {
    debug_assert!((0..1 << 16).contains(&height));
    (height as u64 & 0xffff) | ((creator as u64) << 16) | ((epoch as u64) << 32)
}

/// Exact inverse of [`unit_id`].
pub fn decode_id(id: u64) -> (Height, NodeId, Epoch) {
    (
        (id & 0xffff) as Height,
        ((id >> 16) & 0xffff) as NodeId,
        (id >> 32) as Epoch,
    )
}

/// An unsituated vertex: everything a unit carries before its parents have
/// been resolved against a DAG. This is the form peers exchange.
#[derive(Clone)]
pub struct PreUnit {
    creator: NodeId,
    epoch: Epoch,
    height: Height,
    crown: Crown,
    data: Vec<u8>,
    rs_data: Vec<u8>,
    hash: UnitDigest,
}

impl PreUnit {
    pub fn new(
        creator: NodeId,
        epoch: Epoch,
        height: Height,
        crown: Crown,
        data: Vec<u8>,
        rs_data: Vec<u8>,
        algo: DigestAlgorithm,
    ) -> Self {
        let hash = Self::compute_hash(
            algo,
            unit_id(height, creator, epoch),
            &crown,
            &data,
            &rs_data,
        );
        Self {
            creator,
            epoch,
            height,
            crown,
            data,
            rs_data,
            hash,
        }
    }

    /// H(id || crown || data || rsData) under the configured algorithm.
    pub fn compute_hash(
        algo: DigestAlgorithm,
        id: u64,
        crown: &Crown,
        data: &[u8],
        rs_data: &[u8],
    ) -> UnitDigest {
        let mut hasher = algo.hasher();
        hasher.update(&id.to_le_bytes());
        crown.write_to(&mut hasher);
        hasher.update(data);
        hasher.update(rs_data);
        hasher.finalize()
    }

    pub fn id(&self) -> u64 {
        unit_id(self.height, self.creator, self.epoch)
    }

    pub fn creator(&self) -> NodeId {
        self.creator
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn crown(&self) -> &Crown {
        &self.crown
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn rs_data(&self) -> &[u8] {
        &self.rs_data
    }

    pub fn hash(&self) -> UnitDigest {
        self.hash
    }

    /// Dealing units open an epoch and have no parents.
    pub fn dealing(&self) -> bool {
        self.height == 0
    }
}

impl fmt::Debug for PreUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}-{} {:?}]",
            self.creator, self.epoch, self.height, self.hash
        )
    }
}

/// A unit situated in a DAG: a [`PreUnit`] plus its resolved parents, its
/// computed level and its floor (per-creator maximal ancestors).
pub struct Unit {
    pre: PreUnit,
    parents: Vec<Option<Arc<Unit>>>,
    level: Level,
    floor: Vec<Vec<Arc<Unit>>>,
}

impl Unit {
    /// Builds a fully materialised unit straight from resolved parents. Used
    /// by the creator for its own units; the crown, level and floor are all
    /// derived here so they can never disagree with the DAG's own rules.
    pub fn new_free(
        creator: NodeId,
        epoch: Epoch,
        parents: Vec<Option<Arc<Unit>>>,
        data: Vec<u8>,
        rs_data: Vec<u8>,
        algo: DigestAlgorithm,
        quorum: usize,
    ) -> Arc<Unit> {
        let height = match &parents[creator as usize] {
            Some(predecessor) => predecessor.height() + 1,
            None => 0,
        };
        let parent_info: Vec<_> = parents
            .iter()
            .map(|p| p.as_ref().map(|u| (u.height(), u.hash())))
            .collect();
        let crown = Crown::from_parent_info(&parent_info, algo);
        let pre = PreUnit::new(creator, epoch, height, crown, data, rs_data, algo);
        Self::from_parents(pre, parents, quorum)
    }

    /// Situates a validated pre-unit against its resolved parents.
    pub fn from_parents(
        pre: PreUnit,
        parents: Vec<Option<Arc<Unit>>>,
        quorum: usize,
    ) -> Arc<Unit> {
        let level = level_from_parents(&parents, quorum);
        let floor = compute_floor(parents.len(), &parents);
        Arc::new(Unit {
            pre,
            parents,
            level,
            floor,
        })
    }

    pub fn as_pre_unit(&self) -> &PreUnit {
        &self.pre
    }

    pub fn id(&self) -> u64 {
        self.pre.id()
    }

    pub fn creator(&self) -> NodeId {
        self.pre.creator()
    }

    pub fn epoch(&self) -> Epoch {
        self.pre.epoch()
    }

    pub fn height(&self) -> Height {
        self.pre.height()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn hash(&self) -> UnitDigest {
        self.pre.hash()
    }

    pub fn data(&self) -> &[u8] {
        self.pre.data()
    }

    pub fn rs_data(&self) -> &[u8] {
        self.pre.rs_data()
    }

    pub fn crown(&self) -> &Crown {
        self.pre.crown()
    }

    pub fn dealing(&self) -> bool {
        self.pre.dealing()
    }

    pub fn parents(&self) -> &[Option<Arc<Unit>>] {
        &self.parents
    }

    /// The self-parent, `parents[creator]`.
    pub fn predecessor(&self) -> Option<&Arc<Unit>> {
        self.parents[self.creator() as usize].as_ref()
    }

    /// Maximal ancestors created by `creator`, sorted by hash.
    pub fn floor(&self, creator: NodeId) -> &[Arc<Unit>] {
        &self.floor[creator as usize]
    }

    /// True when `other` lies in this unit's past (reflexively).
    pub fn above(&self, other: &Unit) -> bool {
        if self.hash() == other.hash() {
            return true;
        }
        if other.level() > self.level() || other.height() < 0 {
            return false;
        }
        if other.creator() == self.creator() {
            return chain_reaches(self, other);
        }
        self.floor(other.creator())
            .iter()
            .any(|w| chain_reaches(w, other))
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}-{} @{} {:?}]",
            self.creator(),
            self.epoch(),
            self.height(),
            self.level(),
            self.hash()
        )
    }
}

/// 0 for a dealing unit, otherwise the maximum parent level, incremented when
/// a quorum of parents sit at that maximum.
pub fn level_from_parents(parents: &[Option<Arc<Unit>>], quorum: usize) -> Level {
    let mut max_level = -1;
    for parent in parents.iter().flatten() {
        max_level = max_level.max(parent.level());
    }
    if max_level < 0 {
        return 0;
    }
    let at_max = parents
        .iter()
        .flatten()
        .filter(|p| p.level() == max_level)
        .count();
    if at_max >= quorum {
        max_level + 1
    } else {
        max_level
    }
}

/// Descends `top`'s predecessor chain to `target.height()` and compares
/// hashes, so forked creators are judged by identity rather than height.
fn chain_reaches(top: &Unit, target: &Unit) -> bool {
    if top.height() < target.height() {
        return false;
    }
    let mut current = top;
    while current.height() > target.height() {
        match current.predecessor() {
            Some(p) => current = p,
            None => return false,
        }
    }
    current.hash() == target.hash()
}

fn compute_floor(n_proc: usize, parents: &[Option<Arc<Unit>>]) -> Vec<Vec<Arc<Unit>>> {
    let mut floor = vec![Vec::new(); n_proc];
    for (c, slot) in floor.iter_mut().enumerate() {
        let mut candidates: Vec<Arc<Unit>> = Vec::new();
        if let Some(parent) = &parents[c] {
            candidates.push(parent.clone());
        }
        for parent in parents.iter().flatten() {
            candidates.extend(parent.floor(c as NodeId).iter().cloned());
        }
        let mut maximal: Vec<Arc<Unit>> = Vec::new();
        for candidate in candidates {
            if maximal.iter().any(|m| m.above(&candidate)) {
                continue;
            }
            maximal.retain(|m| !candidate.above(m));
            maximal.push(candidate);
        }
        maximal.sort_by_key(|u| u.hash());
        *slot = maximal;
    }
    floor
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALGO: DigestAlgorithm = DigestAlgorithm::Blake2s256;

    fn dealing(creator: NodeId, n: usize) -> Arc<Unit> {
        Unit::new_free(creator, 0, vec![None; n], vec![], vec![], ALGO, 3)
    }

    #[test]
    fn test_id_round_trip() {
        for (h, c, e) in [(0, 0, 0), (1, 3, 0), (17, 0xffff, 0), (0xffff, 7, 0xdead_beef)] {
            let id = unit_id(h, c, e);
            assert_eq!(decode_id(id), (h, c, e));
        }
    }

    #[test]
    fn test_dealing_unit_has_level_zero() {
        let u = dealing(1, 4);
        assert_eq!(u.height(), 0);
        assert_eq!(u.level(), 0);
        assert!(u.dealing());
        assert!(u.predecessor().is_none());
        assert_eq!(u.crown(), &Crown::empty(4, ALGO));
    }

    #[test]
    fn test_level_increments_on_quorum() {
        let dealings: Vec<_> = (0..4).map(|c| dealing(c, 4)).collect();

        // Three parents at level 0 is a quorum for N=4, so the child sits at 1.
        let parents = vec![
            Some(dealings[0].clone()),
            Some(dealings[1].clone()),
            Some(dealings[2].clone()),
            None,
        ];
        assert_eq!(level_from_parents(&parents, 3), 1);

        // Two parents at the maximum is below quorum, level stays.
        let parents = vec![Some(dealings[0].clone()), Some(dealings[1].clone()), None, None];
        assert_eq!(level_from_parents(&parents, 3), 0);
    }

    #[test]
    fn test_above_follows_parent_edges() {
        let dealings: Vec<_> = (0..4).map(|c| dealing(c, 4)).collect();
        let parents = vec![
            Some(dealings[0].clone()),
            Some(dealings[1].clone()),
            Some(dealings[2].clone()),
            None,
        ];
        let child = Unit::new_free(0, 0, parents, vec![1], vec![], ALGO, 3);

        assert!(child.above(&dealings[0]));
        assert!(child.above(&dealings[1]));
        assert!(child.above(&dealings[2]));
        assert!(!child.above(&dealings[3]));
        assert!(child.above(&child));
        assert!(!dealings[0].above(&child));
    }

    #[test]
    fn test_floor_holds_maximal_ancestors() {
        let dealings: Vec<_> = (0..4).map(|c| dealing(c, 4)).collect();
        let parents = vec![
            Some(dealings[0].clone()),
            Some(dealings[1].clone()),
            Some(dealings[2].clone()),
            None,
        ];
        let mid = Unit::new_free(1, 0, parents, vec![], vec![], ALGO, 3);

        // A later unit seeing `mid` must floor creator 1 at `mid`, not at the
        // dealing unit below it.
        let parents = vec![
            Some(dealings[0].clone()),
            Some(mid.clone()),
            Some(dealings[2].clone()),
            None,
        ];
        let top = Unit::new_free(0, 0, parents, vec![], vec![], ALGO, 3);
        assert_eq!(top.floor(1).len(), 1);
        assert_eq!(top.floor(1)[0].hash(), mid.hash());
        assert!(top.floor(3).is_empty());
    }

    #[test]
    fn test_hash_covers_data_and_rs_data() {
        let a = Unit::new_free(0, 0, vec![None; 4], vec![1], vec![], ALGO, 3);
        let b = Unit::new_free(0, 0, vec![None; 4], vec![2], vec![], ALGO, 3);
        let c = Unit::new_free(0, 0, vec![None; 4], vec![1], vec![9], ALGO, 3);
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}
