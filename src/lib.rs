//! Asynchronous Byzantine fault tolerant atomic broadcast.
//!
//! A fixed committee of N processes, at most (N-1)/3 of them faulty, each
//! periodically creates *units* referencing parents from the previous level
//! of a growing DAG. A deterministic, coin-free selection picks one *timing
//! unit* per level; the new portion of its past is flattened into a
//! *pre-block*, and every correct process emits the identical pre-block
//! sequence.
//!
//! The crate is a pure protocol engine: no transport, no storage, no
//! application execution. Peer units come in through the [`Controller`]'s
//! input belt, this process's units leave through the unit sink for
//! broadcast, and committed pre-blocks leave through the pre-block sink.

pub mod committee;
pub mod config;
pub mod controller;
pub mod creator;
pub mod crown;
pub mod crypto;
pub mod dag;
pub mod epoch;
pub mod extender;
pub mod metrics;
pub mod rsource;
pub mod types;
pub mod unit;
pub mod wire;

pub use committee::{Committee, Signer};
pub use config::{Config, ConfigError};
pub use controller::{Controller, Ethereal, EtherealError, InputSender, PreBlockSink, UnitSink};
pub use creator::{DataSource, QueueDataSource};
pub use crypto::{DigestAlgorithm, UnitDigest};
pub use dag::{AddOutcome, Dag, DagError};
pub use epoch::{EpochProofBuilder, ProofBuilderFactory, ThresholdProofBuilder};
pub use rsource::{DeterministicRandomSource, RandomSource};
pub use types::{Epoch, Height, Level, NodeId, PreBlock};
pub use unit::{decode_id, unit_id, PreUnit, Unit};
pub use wire::{WireError, WirePreUnit};
