// Error taxonomy of the daemon core
//
// Five classes with distinct handling:
//   Validation  - deterministic rejection, never retried
//   Transient   - peer/network trouble, absorbed by failover
//   Quota       - rate-limit deferral, surfaced as Deferred(until), not failure
//   Integrity   - sync-level verification failure, abort attempt + retry elsewhere
//   Fatal       - durable store unavailable; node halts writes

use thiserror::Error;

use stratos_common::{
    block::{BlockError, BlockHeight, HeaderError},
    error::CommonError,
    time::TimestampSeconds,
    transaction::TransactionError,
};

use crate::p2p::error::P2pError;

#[derive(Debug, Error)]
pub enum BlockchainError {
    // --- validation ---
    #[error(transparent)]
    InvalidBlock(#[from] BlockError),
    #[error(transparent)]
    InvalidHeader(#[from] HeaderError),
    #[error(transparent)]
    InvalidTransaction(#[from] TransactionError),
    #[error("block height {actual} does not extend tip {tip}")]
    NonSequentialBlock { tip: BlockHeight, actual: BlockHeight },
    #[error("block at height {height} does not link to tip hash {expected}")]
    BrokenChainLink { height: BlockHeight, expected: String },
    #[error("block timestamp must be strictly after the tip")]
    TimestampNotMonotonic,
    #[error("first block must be genesis (index 0, previous hash \"0\")")]
    GenesisRequired,
    #[error("validator {0} is not allowed to mint this block")]
    ValidatorNotAllowed(String),
    #[error("transaction {0} already known")]
    DuplicateTransaction(String),
    #[error("mempool is full")]
    MempoolFull,

    // --- transient (network) ---
    #[error(transparent)]
    P2p(#[from] P2pError),

    // --- quota ---
    #[error("operation deferred until {0} by rate limiting")]
    Deferred(TimestampSeconds),

    // --- integrity ---
    #[error("snapshot verification failed: {0}")]
    SnapshotVerification(String),
    #[error("header chain verification failed: {0}")]
    HeaderChain(String),
    #[error("no fork majority among {active} active peers (needed {needed})")]
    NoForkMajority { active: usize, needed: usize },
    #[error("sync attempt {0} exceeded its deadline")]
    SyncDeadlineExceeded(String),

    // --- fatal ---
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] CommonError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl BlockchainError {
    /// Validation failures are deterministic and must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BlockchainError::InvalidBlock(_)
                | BlockchainError::InvalidHeader(_)
                | BlockchainError::InvalidTransaction(_)
                | BlockchainError::NonSequentialBlock { .. }
                | BlockchainError::BrokenChainLink { .. }
                | BlockchainError::TimestampNotMonotonic
                | BlockchainError::GenesisRequired
                | BlockchainError::ValidatorNotAllowed(_)
                | BlockchainError::DuplicateTransaction(_)
        )
    }

    /// Transient failures feed the circuit breaker and failover.
    pub fn is_transient(&self) -> bool {
        matches!(self, BlockchainError::P2p(_))
    }
}
