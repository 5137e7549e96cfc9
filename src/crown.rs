use crate::crypto::{DigestAlgorithm, Hasher, UnitDigest};
use crate::types::{Height, NodeId};
use serde::{Deserialize, Serialize};

/// Summary of a unit's parent set: one height per committee slot (`None` for
/// an absent parent) and a combined digest over the parents' hashes. A unit
/// commits to its crown before its own hash exists, so the crown is what
/// travels on the wire; the receiver re-resolves the actual parents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crown {
    heights: Vec<Option<Height>>,
    control_hash: UnitDigest,
}

impl Crown {
    pub fn new(heights: Vec<Option<Height>>, control_hash: UnitDigest) -> Self {
        Self {
            heights,
            control_hash,
        }
    }

    /// The crown of a dealing unit: no parents, digest over N zero hashes.
    pub fn empty(n_proc: u16, algo: DigestAlgorithm) -> Self {
        let heights = vec![None; n_proc as usize];
        let control_hash = combined_hash(
            (0..n_proc).map(|_| UnitDigest::ZERO),
            algo,
        );
        Self {
            heights,
            control_hash,
        }
    }

    /// Builds the crown for a resolved parent slice of `(height, hash)`
    /// pairs, one slot per creator.
    pub fn from_parent_info(parents: &[Option<(Height, UnitDigest)>], algo: DigestAlgorithm) -> Self {
        let heights = parents.iter().map(|p| p.map(|(h, _)| h)).collect();
        let control_hash = combined_hash(
            parents
                .iter()
                .map(|p| p.map(|(_, d)| d).unwrap_or(UnitDigest::ZERO)),
            algo,
        );
        Self {
            heights,
            control_hash,
        }
    }

    pub fn heights(&self) -> &[Option<Height>] {
        &self.heights
    }

    pub fn height_of(&self, creator: NodeId) -> Option<Height> {
        self.heights.get(creator as usize).copied().flatten()
    }

    pub fn control_hash(&self) -> &UnitDigest {
        &self.control_hash
    }

    pub fn n_proc(&self) -> usize {
        self.heights.len()
    }

    /// Number of non-absent parent slots.
    pub fn parent_count(&self) -> usize {
        self.heights.iter().filter(|h| h.is_some()).count()
    }

    /// Canonical byte contribution to the unit hash: each height as i32
    /// little-endian (-1 for absent) followed by the control hash.
    pub fn write_to(&self, hasher: &mut Hasher) {
        for height in &self.heights {
            hasher.update(&height.unwrap_or(-1).to_le_bytes());
        }
        hasher.update(self.control_hash.as_bytes());
    }

    /// Wire representation of the heights row, `-1` for absent slots.
    pub fn wire_heights(&self) -> Vec<i32> {
        self.heights.iter().map(|h| h.unwrap_or(-1)).collect()
    }

    pub fn heights_from_wire(heights: &[i32]) -> Vec<Option<Height>> {
        heights
            .iter()
            .map(|&h| if h < 0 { None } else { Some(h) })
            .collect()
    }
}

/// H(hash_0 || ... || hash_{N-1}) with the zero digest standing in for an
/// absent parent.
pub fn combined_hash(
    hashes: impl Iterator<Item = UnitDigest>,
    algo: DigestAlgorithm,
) -> UnitDigest {
    let mut hasher = algo.hasher();
    for hash in hashes {
        hasher.update(hash.as_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_crown() {
        let crown = Crown::empty(4, DigestAlgorithm::Blake2s256);
        assert_eq!(crown.heights(), &[None, None, None, None]);
        assert_eq!(crown.parent_count(), 0);
        assert_eq!(
            *crown.control_hash(),
            combined_hash(
                (0..4).map(|_| UnitDigest::ZERO),
                DigestAlgorithm::Blake2s256
            )
        );
    }

    #[test]
    fn test_crown_equality_is_heights_and_control_hash() {
        let algo = DigestAlgorithm::Blake2s256;
        let d = algo.hash(b"parent");
        let parents = vec![Some((0, d)), None, Some((2, d)), None];
        let a = Crown::from_parent_info(&parents, algo);
        let b = Crown::from_parent_info(&parents, algo);
        assert_eq!(a, b);

        let other = vec![Some((1, d)), None, Some((2, d)), None];
        assert_ne!(a, Crown::from_parent_info(&other, algo));
    }

    #[test]
    fn test_wire_heights_round_trip() {
        let algo = DigestAlgorithm::Blake2s256;
        let d = algo.hash(b"p");
        let crown = Crown::from_parent_info(&[Some((3, d)), None, Some((0, d))], algo);
        let wire = crown.wire_heights();
        assert_eq!(wire, vec![3, -1, 0]);
        assert_eq!(Crown::heights_from_wire(&wire), crown.heights());
    }
}
