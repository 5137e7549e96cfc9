use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2s256, Digest as _};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// A 32-byte digest under one of the supported algorithms.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitDigest(pub [u8; 32]);

impl UnitDigest {
    /// Stand-in digest for an absent parent slot.
    pub const ZERO: UnitDigest = UnitDigest([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for UnitDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Digest algorithm used for unit hashing. Both variants produce 32 bytes so
/// crowns and wire forms are layout-independent of the choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Blake2s256,
    Blake2b256,
}

impl DigestAlgorithm {
    pub fn hash(&self, bytes: &[u8]) -> UnitDigest {
        let mut hasher = Hasher::new(*self);
        hasher.update(bytes);
        hasher.finalize()
    }

    pub fn hasher(&self) -> Hasher {
        Hasher::new(*self)
    }
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        DigestAlgorithm::Blake2s256
    }
}

/// Incremental hasher over the configured algorithm.
pub enum Hasher {
    Blake2s256(Blake2s256),
    Blake2b256(Blake2b256),
}

impl Hasher {
    fn new(algo: DigestAlgorithm) -> Self {
        match algo {
            DigestAlgorithm::Blake2s256 => Hasher::Blake2s256(Blake2s256::new()),
            DigestAlgorithm::Blake2b256 => Hasher::Blake2b256(Blake2b256::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Blake2s256(h) => h.update(bytes),
            Hasher::Blake2b256(h) => h.update(bytes),
        }
    }

    pub fn finalize(self) -> UnitDigest {
        match self {
            Hasher::Blake2s256(h) => UnitDigest(h.finalize().into()),
            Hasher::Blake2b256(h) => UnitDigest(h.finalize().into()),
        }
    }
}
