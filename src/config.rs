use crate::crypto::DigestAlgorithm;
use crate::types::{Level, NodeId};

/// Protocol parameters for one committee instance. Everything here must be
/// identical on all correct processes; pre-block equivalence is only defined
/// between processes running the same configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Committee size N.
    pub n_proc: u16,
    /// This process's index, in `0..n_proc`.
    pub pid: NodeId,
    /// When true the creator may skip levels, taking its best known
    /// candidates as parents directly. When false every unit sits exactly one
    /// level above its predecessor.
    pub can_skip_level: bool,
    /// Highest level carrying application data; units above it are finishing
    /// units that close the epoch.
    pub last_level: Level,
    /// Number of epochs to produce before the instance quiesces.
    pub number_of_epochs: u32,
    pub digest_algorithm: DigestAlgorithm,
    /// Offset of the first voting round above a candidate's level.
    pub vote_delay: Level,
    /// Maximum number of voting rounds examined before the permutation
    /// fallback picks a timing unit outright.
    pub popularity_cap: Level,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("committee must not be empty")]
    EmptyCommittee,
    #[error("pid {pid} out of range for committee of {n_proc}")]
    PidOutOfRange { pid: NodeId, n_proc: u16 },
    #[error("last_level must be at least 1, got {0}")]
    LastLevelTooSmall(Level),
    #[error("number_of_epochs must be at least 1")]
    NoEpochs,
    #[error("vote_delay must be at least 1, got {0}")]
    VoteDelayTooSmall(Level),
    #[error("popularity_cap {cap} must exceed vote_delay {delay}")]
    PopularityCapTooSmall { cap: Level, delay: Level },
}

impl Config {
    /// The deterministic profile: no level skipping, no common coin, three
    /// epochs of 29 ordered levels each.
    pub fn deterministic(n_proc: u16, pid: NodeId) -> Self {
        Self {
            n_proc,
            pid,
            can_skip_level: false,
            last_level: 28,
            number_of_epochs: 3,
            digest_algorithm: DigestAlgorithm::default(),
            vote_delay: 1,
            popularity_cap: 10,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_proc == 0 {
            return Err(ConfigError::EmptyCommittee);
        }
        if self.pid >= self.n_proc {
            return Err(ConfigError::PidOutOfRange {
                pid: self.pid,
                n_proc: self.n_proc,
            });
        }
        if self.last_level < 1 {
            return Err(ConfigError::LastLevelTooSmall(self.last_level));
        }
        if self.number_of_epochs == 0 {
            return Err(ConfigError::NoEpochs);
        }
        if self.vote_delay < 1 {
            return Err(ConfigError::VoteDelayTooSmall(self.vote_delay));
        }
        if self.popularity_cap <= self.vote_delay {
            return Err(ConfigError::PopularityCapTooSmall {
                cap: self.popularity_cap,
                delay: self.vote_delay,
            });
        }
        Ok(())
    }

    /// f = (N - 1) / 3.
    pub fn byzantine(&self) -> usize {
        (self.n_proc as usize - 1) / 3
    }

    /// 2f + 1.
    pub fn quorum(&self) -> usize {
        2 * self.byzantine() + 1
    }

    pub fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_defaults() {
        let config = Config::deterministic(4, 0);
        assert!(config.validate().is_ok());
        assert_eq!(config.quorum(), 3);
        assert_eq!(config.number_of_epochs, 3);
        assert_eq!(config.last_level, 28);
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let mut config = Config::deterministic(0, 0);
        assert_eq!(config.validate(), Err(ConfigError::EmptyCommittee));

        config = Config::deterministic(4, 4);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PidOutOfRange { .. })
        ));

        config = Config::deterministic(4, 1);
        config.last_level = 0;
        assert_eq!(config.validate(), Err(ConfigError::LastLevelTooSmall(0)));

        config = Config::deterministic(4, 1);
        config.number_of_epochs = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoEpochs));

        config = Config::deterministic(4, 1);
        config.popularity_cap = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PopularityCapTooSmall { .. })
        ));
    }

    #[test]
    fn test_quorum_scaling() {
        for (n, f, q) in [(4u16, 1, 3), (7, 2, 5), (10, 3, 7), (50, 16, 33)] {
            let config = Config::deterministic(n, 0);
            assert_eq!(config.byzantine(), f);
            assert_eq!(config.quorum(), q);
        }
    }
}
