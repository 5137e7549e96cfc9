use crate::committee::{Committee, Signer};
use crate::crypto::UnitDigest;
use crate::types::{Epoch, Level, NodeId};
use crate::unit::Unit;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds and checks the proof that closes one epoch: a quorum of signature
/// shares over the epoch's final timing unit, combined into a certificate
/// that the dealing units of the next epoch carry as data.
pub trait EpochProofBuilder: Send + Sync {
    /// This process's share over (epoch, H(timing unit)), embedded in its
    /// finishing unit.
    fn build_share(&self, timing_unit: &Unit) -> Vec<u8>;
    /// Feeds a unit through the share collector; returns the combined proof
    /// once 2f+1 distinct valid shares are present.
    fn try_building(&self, unit: &Unit) -> Option<Vec<u8>>;
    /// Validates a dealing unit of the next epoch against this epoch.
    fn verify(&self, unit: &Unit) -> bool;
}

pub type ProofBuilderFactory = Arc<dyn Fn(Epoch) -> Arc<dyn EpochProofBuilder> + Send + Sync>;

/// One process's contribution towards the epoch certificate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochShare {
    pub epoch: Epoch,
    pub hash: UnitDigest,
    pub creator: NodeId,
    pub signature: Vec<u8>,
}

/// The combined certificate: 2f+1 distinct shares over the same timing unit,
/// sorted by creator so the encoding is canonical for a given share set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochProof {
    pub epoch: Epoch,
    pub hash: UnitDigest,
    pub shares: Vec<(NodeId, Vec<u8>)>,
}

fn share_message(epoch: Epoch, hash: &UnitDigest) -> Vec<u8> {
    let mut message = Vec::with_capacity(4 + 32);
    message.extend_from_slice(&epoch.to_le_bytes());
    message.extend_from_slice(hash.as_bytes());
    message
}

/// Proof builder over the committee's ed25519 keys. Shares ride in finishing
/// units (level above `last_level`); anything else offered to `try_building`
/// is ignored.
pub struct ThresholdProofBuilder {
    epoch: Epoch,
    pid: NodeId,
    last_level: Level,
    committee: Arc<Committee>,
    signer: Signer,
    collected: Mutex<HashMap<UnitDigest, BTreeMap<NodeId, Vec<u8>>>>,
}

impl ThresholdProofBuilder {
    pub fn new(
        epoch: Epoch,
        pid: NodeId,
        last_level: Level,
        committee: Arc<Committee>,
        signer: Signer,
    ) -> Self {
        Self {
            epoch,
            pid,
            last_level,
            committee,
            signer,
            collected: Mutex::new(HashMap::new()),
        }
    }

    /// A factory handing one builder per epoch, as the creator advances.
    pub fn factory(
        pid: NodeId,
        last_level: Level,
        committee: Arc<Committee>,
        signer: Signer,
    ) -> ProofBuilderFactory {
        Arc::new(move |epoch| {
            Arc::new(ThresholdProofBuilder::new(
                epoch,
                pid,
                last_level,
                committee.clone(),
                signer.clone(),
            )) as Arc<dyn EpochProofBuilder>
        })
    }

    /// A share counts only when its epoch matches, its creator stamp matches
    /// the unit that carried it, and the committee key checks out.
    fn check_share(&self, share: &EpochShare, expected_creator: NodeId) -> bool {
        share.epoch == self.epoch
            && share.creator == expected_creator
            && self.committee.verify(
                share.creator,
                &share_message(share.epoch, &share.hash),
                &share.signature,
            )
    }
}

impl EpochProofBuilder for ThresholdProofBuilder {
    fn build_share(&self, timing_unit: &Unit) -> Vec<u8> {
        let hash = timing_unit.hash();
        let share = EpochShare {
            epoch: self.epoch,
            hash,
            creator: self.pid,
            signature: self.signer.sign(&share_message(self.epoch, &hash)).to_vec(),
        };
        bincode::serialize(&share).unwrap_or_default()
    }

    fn try_building(&self, unit: &Unit) -> Option<Vec<u8>> {
        if unit.epoch() != self.epoch || unit.level() <= self.last_level {
            return None;
        }
        let share: EpochShare = bincode::deserialize(unit.data()).ok()?;
        if !self.check_share(&share, unit.creator()) {
            debug!(creator = unit.creator(), epoch = self.epoch, "invalid share ignored");
            return None;
        }
        let mut collected = self.collected.lock();
        let shares = collected.entry(share.hash).or_default();
        shares.insert(share.creator, share.signature);
        if !self.committee.is_quorum(shares.len()) {
            return None;
        }
        info!(
            epoch = self.epoch,
            shares = shares.len(),
            "combined epoch proof"
        );
        let proof = EpochProof {
            epoch: self.epoch,
            hash: share.hash,
            shares: shares.iter().map(|(c, s)| (*c, s.clone())).collect(),
        };
        Some(bincode::serialize(&proof).unwrap_or_default())
    }

    fn verify(&self, unit: &Unit) -> bool {
        if !unit.dealing() {
            return false;
        }
        let proof: EpochProof = match bincode::deserialize(unit.data()) {
            Ok(proof) => proof,
            Err(_) => {
                warn!(epoch = self.epoch, "undecodable epoch proof");
                return false;
            }
        };
        if proof.epoch != self.epoch {
            return false;
        }
        let message = share_message(proof.epoch, &proof.hash);
        let mut seen = HashSet::new();
        let valid = proof
            .shares
            .iter()
            .filter(|(creator, signature)| {
                seen.insert(*creator) && self.committee.verify(*creator, &message, signature)
            })
            .count();
        self.committee.is_quorum(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DigestAlgorithm;

    const ALGO: DigestAlgorithm = DigestAlgorithm::Blake2s256;
    const LAST_LEVEL: Level = 1;

    /// A chain deep enough to put its head above LAST_LEVEL, carrying `data`.
    fn finishing_unit(creator: NodeId, data: Vec<u8>) -> Arc<Unit> {
        let dealings: Vec<_> = (0..4)
            .map(|c| Unit::new_free(c, 0, vec![None; 4], vec![], vec![], ALGO, 3))
            .collect();
        let mut tops = dealings.clone();
        for _ in 0..2 {
            let next: Vec<_> = (0..4u16)
                .map(|c| {
                    let parents: Vec<_> = tops.iter().map(|u| Some(u.clone())).collect();
                    Unit::new_free(c, 0, parents, vec![], vec![], ALGO, 3)
                })
                .collect();
            tops = next;
        }
        let parents: Vec<_> = tops.iter().map(|u| Some(u.clone())).collect();
        Unit::new_free(creator, 0, parents, data, vec![], ALGO, 3)
    }

    #[test]
    fn test_quorum_of_shares_combines_and_verifies() {
        let (committee, signers) = Committee::local(4);
        let committee = Arc::new(committee);
        let builders: Vec<_> = signers
            .iter()
            .enumerate()
            .map(|(i, signer)| {
                ThresholdProofBuilder::new(
                    0,
                    i as NodeId,
                    LAST_LEVEL,
                    committee.clone(),
                    signer.clone(),
                )
            })
            .collect();

        let timing = finishing_unit(0, vec![]);

        let mut proof = None;
        for i in 0..3 {
            let share = builders[i].build_share(&timing);
            let carrier = finishing_unit(i as NodeId, share);
            assert!(carrier.level() > LAST_LEVEL);
            proof = builders[3].try_building(&carrier);
            if i < 2 {
                assert!(proof.is_none(), "no proof below quorum");
            }
        }
        let proof = proof.expect("three shares reach quorum for N=4");

        // Any honest process accepts a dealing unit of epoch 1 carrying it.
        let dealing = Unit::new_free(2, 1, vec![None; 4], proof, vec![], ALGO, 3);
        for builder in &builders {
            assert!(builder.verify(&dealing));
        }
    }

    #[test]
    fn test_duplicate_and_foreign_shares_ignored() {
        let (committee, signers) = Committee::local(4);
        let committee = Arc::new(committee);
        let collector =
            ThresholdProofBuilder::new(0, 3, LAST_LEVEL, committee.clone(), signers[3].clone());
        let signer =
            ThresholdProofBuilder::new(0, 0, LAST_LEVEL, committee.clone(), signers[0].clone());
        let timing = finishing_unit(0, vec![]);

        let share = signer.build_share(&timing);
        for _ in 0..5 {
            // The same creator resubmitting never reaches quorum.
            assert!(collector
                .try_building(&finishing_unit(0, share.clone()))
                .is_none());
        }

        // A share stamped with somebody else's creator id fails the binding.
        assert!(collector
            .try_building(&finishing_unit(1, share.clone()))
            .is_none());

        // Regular payloads below the finishing levels are never mistaken for
        // shares.
        let regular = finishing_unit(1, b"application data".to_vec());
        let _ = collector.try_building(&regular);
    }

    #[test]
    fn test_verify_rejects_garbage_and_wrong_epoch() {
        let (committee, signers) = Committee::local(4);
        let committee = Arc::new(committee);
        let builder =
            ThresholdProofBuilder::new(0, 0, LAST_LEVEL, committee.clone(), signers[0].clone());

        let garbage = Unit::new_free(1, 1, vec![None; 4], b"junk".to_vec(), vec![], ALGO, 3);
        assert!(!builder.verify(&garbage));

        // A proof bound to the wrong epoch fails even with a valid signature.
        let timing = finishing_unit(0, vec![]);
        let message = share_message(5, &timing.hash());
        let proof = EpochProof {
            epoch: 5,
            hash: timing.hash(),
            shares: vec![(1, signers[1].sign(&message).to_vec())],
        };
        let dealing = Unit::new_free(
            1,
            1,
            vec![None; 4],
            bincode::serialize(&proof).unwrap(),
            vec![],
            ALGO,
            3,
        );
        assert!(!builder.verify(&dealing));
    }
}
