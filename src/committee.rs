use crate::types::NodeId;
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// The fixed set of N processes running one protocol instance. Members are
/// nothing more than the dense indices `0..N`; slot i holds member i's
/// share-verification key. At most `byzantine()` members may be faulty and
/// `quorum()` of them are enough to make progress.
#[derive(Clone, Debug)]
pub struct Committee {
    keys: Vec<VerifyingKey>,
}

impl Committee {
    pub fn from_keys(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// An in-process committee whose keys are derived from the member
    /// indices. Every participant derives the same committee, so local
    /// networks need no key exchange. Returns each member's signing half
    /// alongside.
    pub fn local(n_proc: u16) -> (Self, Vec<Signer>) {
        let signers: Vec<Signer> = (0..n_proc).map(Signer::for_member).collect();
        let keys = signers.iter().map(|s| s.verifying_key()).collect();
        (Self { keys }, signers)
    }

    pub fn n_proc(&self) -> u16 {
        self.keys.len() as u16
    }

    /// f = (N - 1) / 3, the number of tolerated Byzantine members.
    pub fn byzantine(&self) -> usize {
        self.keys.len().saturating_sub(1) / 3
    }

    /// 2f + 1.
    pub fn quorum(&self) -> usize {
        2 * self.byzantine() + 1
    }

    pub fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum()
    }

    /// Checks a raw signature by `member` over `message`; unknown members
    /// and malformed signature bytes simply fail the check.
    pub fn verify(&self, member: NodeId, message: &[u8], signature: &[u8]) -> bool {
        let key = match self.keys.get(member as usize) {
            Some(key) => key,
            None => return false,
        };
        let bytes: [u8; 64] = match signature.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        key.verify_strict(message, &Signature::from_bytes(&bytes))
            .is_ok()
    }
}

/// One committee member's signing half, used only for epoch-proof shares.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn random() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// The index-derived key of a local committee member.
    fn for_member(member: NodeId) -> Self {
        let mut seed = [0x5eu8; 32];
        seed[..2].copy_from_slice(&member.to_le_bytes());
        Self::from_seed(&seed)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_committee_round_trip() {
        let (committee, signers) = Committee::local(4);
        assert_eq!(committee.n_proc(), 4);
        assert_eq!(signers.len(), 4);

        let message = b"epoch share";
        for (member, signer) in signers.iter().enumerate() {
            let signature = signer.sign(message);
            assert!(committee.verify(member as NodeId, message, &signature));
            // The same bytes under any other member's key must fail.
            let other = (member + 1) % 4;
            assert!(!committee.verify(other as NodeId, message, &signature));
        }
    }

    #[test]
    fn test_local_committee_is_reproducible() {
        let (a, _) = Committee::local(4);
        let (b, signers) = Committee::local(4);
        let signature = signers[2].sign(b"m");
        assert!(a.verify(2, b"m", &signature));
        assert!(b.verify(2, b"m", &signature));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let (committee, signers) = Committee::local(4);
        let signature = signers[0].sign(b"m");

        // Out-of-committee member, truncated bytes, wrong message.
        assert!(!committee.verify(7, b"m", &signature));
        assert!(!committee.verify(0, b"m", &signature[..30]));
        assert!(!committee.verify(0, b"other", &signature));

        let stranger = Signer::random();
        assert!(!committee.verify(0, b"m", &stranger.sign(b"m")));
    }

    #[test]
    fn test_quorum_scaling() {
        for (n, f, q) in [(4u16, 1, 3), (7, 2, 5), (10, 3, 7), (50, 16, 33)] {
            let (committee, _) = Committee::local(n);
            assert_eq!(committee.byzantine(), f);
            assert_eq!(committee.quorum(), q);
            assert!(committee.is_quorum(q));
            assert!(!committee.is_quorum(q - 1));
        }
    }
}
