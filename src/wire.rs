use crate::crown::Crown;
use crate::crypto::{DigestAlgorithm, UnitDigest};
use crate::unit::{decode_id, PreUnit, Unit};
use serde::{Deserialize, Serialize};

/// Serialised form of a pre-unit. The crown travels as its heights row plus
/// control hash; the receiver re-resolves the parents locally and recomputes
/// the unit hash, so nothing here is trusted beyond these bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePreUnit {
    pub id: u64,
    pub data: Vec<u8>,
    pub rs_data: Vec<u8>,
    pub heights: Vec<i32>,
    pub control_hash: [u8; 32],
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("crown heights disagree with unit id: height {height}, crown says {crown_height}")]
    InconsistentCrown { height: i32, crown_height: i32 },
    #[error("decode failed: {0}")]
    Decode(#[from] bincode::Error),
}

impl WirePreUnit {
    pub fn from_pre_unit(pre: &PreUnit) -> Self {
        Self {
            id: pre.id(),
            data: pre.data().to_vec(),
            rs_data: pre.rs_data().to_vec(),
            heights: pre.crown().wire_heights(),
            control_hash: *pre.crown().control_hash().as_bytes(),
        }
    }

    pub fn from_unit(unit: &Unit) -> Self {
        Self::from_pre_unit(unit.as_pre_unit())
    }

    /// Rebuilds the pre-unit, checking that the crown's own-creator height is
    /// exactly one below the height packed into the id.
    pub fn into_pre_unit(self, algo: DigestAlgorithm) -> Result<PreUnit, WireError> {
        let (height, creator, epoch) = decode_id(self.id);
        let crown_height = self
            .heights
            .get(creator as usize)
            .copied()
            .unwrap_or(-1);
        if height != crown_height + 1 {
            return Err(WireError::InconsistentCrown {
                height,
                crown_height,
            });
        }
        let crown = Crown::new(
            Crown::heights_from_wire(&self.heights),
            UnitDigest(self.control_hash),
        );
        Ok(PreUnit::new(
            creator,
            epoch,
            height,
            crown,
            self.data,
            self.rs_data,
            algo,
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
