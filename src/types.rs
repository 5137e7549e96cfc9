use serde::{Deserialize, Serialize};

/// Index of a committee member, in `0..n_proc`.
pub type NodeId = u16;
/// Epoch counter. Epochs are totally ordered and start at 0.
pub type Epoch = u32;
/// Position of a unit in its creator's chain. Dealing units have height 0.
pub type Height = i32;
/// DAG depth as defined by the quorum-on-parents rule.
pub type Level = i32;

/// One deterministic output batch: the ordered application payloads below a
/// timing unit, plus shared randomness derived from the batch itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreBlock {
    pub data: Vec<Vec<u8>>,
    pub random_bytes: [u8; 32],
}

impl PreBlock {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
