// Block header
//
// Carries every field the block hash commits to. Light clients sync and
// verify headers alone; the body (transactions, contract results, metadata)
// is committed through merkle_root and state_root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{
    crypto::{sha256, Address, Hash},
    error::CommonError,
    serializer::to_canonical_json,
    time::TimestampMillis,
};

/// Sentinel previous-hash of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

pub type BlockHeight = u64;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header hash mismatch at height {height}: expected {expected}, got {actual}")]
    HashMismatch {
        height: BlockHeight,
        expected: Hash,
        actual: Hash,
    },
    #[error("broken header chain at height {height}: previous hash {previous} does not match {expected}")]
    BrokenLink {
        height: BlockHeight,
        previous: String,
        expected: String,
    },
    #[error("non-monotonic timestamp at height {height}")]
    NonMonotonicTimestamp { height: BlockHeight },
    #[error(transparent)]
    Common(#[from] CommonError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: BlockHeight,
    pub timestamp: TimestampMillis,
    // hex of the parent hash, or "0" for genesis
    pub previous_hash: String,
    pub merkle_root: Hash,
    pub state_root: Hash,
    pub nonce: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub difficulty: u64,
    pub validators: Vec<Address>,
    pub stakes: BTreeMap<Address, u64>,
    pub hash: Hash,
}

impl BlockHeader {
    /// Recompute the hash this header should carry:
    /// sha256(index || timestamp || previous_hash || merkle_root ||
    /// state_root || nonce || gas_used || gas_limit || difficulty ||
    /// canonical(validators) || canonical(stakes))
    pub fn compute_hash(&self) -> Result<Hash, CommonError> {
        let mut preimage = String::new();
        preimage.push_str(&self.index.to_string());
        preimage.push_str(&self.timestamp.to_string());
        preimage.push_str(&self.previous_hash);
        preimage.push_str(&self.merkle_root.to_hex());
        preimage.push_str(&self.state_root.to_hex());
        preimage.push_str(&self.nonce.to_string());
        preimage.push_str(&self.gas_used.to_string());
        preimage.push_str(&self.gas_limit.to_string());
        preimage.push_str(&self.difficulty.to_string());
        preimage.push_str(&to_canonical_json(&self.validators)?);
        preimage.push_str(&to_canonical_json(&self.stakes)?);
        Ok(sha256(preimage.as_bytes()))
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Verify that the carried hash matches the recomputation.
    pub fn verify_hash(&self) -> Result<(), HeaderError> {
        let expected = self.compute_hash()?;
        if expected != self.hash {
            return Err(HeaderError::HashMismatch {
                height: self.index,
                expected,
                actual: self.hash.clone(),
            });
        }
        Ok(())
    }

    /// Verify that `self` directly extends `previous`.
    pub fn verify_link(&self, previous: &BlockHeader) -> Result<(), HeaderError> {
        let expected = previous.hash.to_hex();
        if self.previous_hash != expected {
            return Err(HeaderError::BrokenLink {
                height: self.index,
                previous: self.previous_hash.clone(),
                expected,
            });
        }
        if self.timestamp <= previous.timestamp {
            return Err(HeaderError::NonMonotonicTimestamp {
                height: self.index,
            });
        }
        Ok(())
    }
}

/// Validate a contiguous run of headers: each hash recomputes and each
/// header extends the one before it. Used by light sync.
pub fn verify_header_chain(headers: &[BlockHeader]) -> Result<(), HeaderError> {
    for (i, header) in headers.iter().enumerate() {
        header.verify_hash()?;
        if i > 0 {
            header.verify_link(&headers[i - 1])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::merkle::MerkleTree;

    pub(crate) fn sample_header(index: BlockHeight, previous_hash: String) -> BlockHeader {
        let mut header = BlockHeader {
            index,
            timestamp: 1_700_000_000_000 + index,
            previous_hash,
            merkle_root: MerkleTree::empty_root(),
            state_root: MerkleTree::empty_root(),
            nonce: 0,
            gas_used: 0,
            gas_limit: 30_000_000,
            difficulty: 1,
            validators: vec!["validator-a".to_string()],
            stakes: BTreeMap::from([("validator-a".to_string(), 100)]),
            hash: Hash::zero(),
        };
        header.hash = header.compute_hash().unwrap();
        header
    }

    #[test]
    fn test_hash_recomputes() {
        let header = sample_header(0, GENESIS_PREVIOUS_HASH.to_string());
        assert!(header.verify_hash().is_ok());
    }

    #[test]
    fn test_tampered_field_changes_hash() {
        let mut header = sample_header(0, GENESIS_PREVIOUS_HASH.to_string());
        header.gas_used = 1;
        assert!(matches!(
            header.verify_hash(),
            Err(HeaderError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_header_chain_verifies() {
        let genesis = sample_header(0, GENESIS_PREVIOUS_HASH.to_string());
        let next = sample_header(1, genesis.hash.to_hex());
        assert!(verify_header_chain(&[genesis, next]).is_ok());
    }

    #[test]
    fn test_broken_link_detected() {
        let genesis = sample_header(0, GENESIS_PREVIOUS_HASH.to_string());
        let stranger = sample_header(1, "deadbeef".to_string());
        assert!(matches!(
            verify_header_chain(&[genesis, stranger]),
            Err(HeaderError::BrokenLink { .. })
        ));
    }
}
