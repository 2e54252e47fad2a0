// Inter-node sync wire formats
//
// Block payloads downloaded from peers are semi-trusted: fields may be
// missing or renamed (`height` vs `index`), commitments may be absent.
// Conversion keeps whatever the peer claimed; `Block::verify` decides.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

use crate::{
    block::{Block, BlockHeader, BlockHeight},
    contract::ExecutionResult,
    crypto::{Address, Hash},
    error::CommonError,
    time::TimestampMillis,
    transaction::Transaction,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPayload {
    #[serde(alias = "height")]
    pub index: BlockHeight,
    pub timestamp: TimestampMillis,
    pub previous_hash: String,
    #[serde(default)]
    pub merkle_root: Option<Hash>,
    #[serde(default)]
    pub state_root: Option<Hash>,
    #[serde(default)]
    pub hash: Option<Hash>,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub gas_used: u64,
    #[serde(default)]
    pub gas_limit: u64,
    #[serde(default)]
    pub difficulty: u64,
    #[serde(default)]
    pub validators: Vec<Address>,
    #[serde(default)]
    pub stakes: BTreeMap<Address, u64>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub smart_contract_results: BTreeMap<Address, ExecutionResult>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl BlockPayload {
    /// Identity used for cross-peer quorum counting: the explicit hash when
    /// the peer sent one, otherwise a legacy SHA-1 digest over the fields
    /// every payload carries.
    pub fn fingerprint(&self) -> String {
        if let Some(hash) = &self.hash {
            return hash.to_hex();
        }
        let mut hasher = Sha1::new();
        hasher.update(self.index.to_string().as_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.transactions.len().to_string().as_bytes());
        if let Some(merkle_root) = &self.merkle_root {
            hasher.update(merkle_root.to_hex().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Convert into a `Block`, preserving carried commitments and computing
    /// any the peer omitted.
    pub fn into_block(self) -> Result<Block, CommonError> {
        use crate::block::{compute_state_root, MerkleTree};

        let merkle_root = match self.merkle_root {
            Some(root) => root,
            None => {
                let leaves = self
                    .transactions
                    .iter()
                    .map(|tx| tx.hash().clone())
                    .collect();
                MerkleTree::new(leaves).root()
            }
        };
        let state_root = match self.state_root {
            Some(root) => root,
            None => compute_state_root(
                &self.transactions,
                &self.smart_contract_results,
                &self.metadata,
            )?,
        };

        let mut header = BlockHeader {
            index: self.index,
            timestamp: self.timestamp,
            previous_hash: self.previous_hash,
            merkle_root,
            state_root,
            nonce: self.nonce,
            gas_used: self.gas_used,
            gas_limit: self.gas_limit,
            difficulty: self.difficulty,
            validators: self.validators,
            stakes: self.stakes,
            hash: Hash::zero(),
        };
        header.hash = match self.hash {
            Some(hash) => hash,
            None => header.compute_hash()?,
        };

        Ok(Block::from_raw_parts(
            header,
            self.transactions,
            self.smart_contract_results,
            self.metadata,
        ))
    }
}

impl From<&Block> for BlockPayload {
    fn from(block: &Block) -> Self {
        let header = block.header();
        BlockPayload {
            index: header.index,
            timestamp: header.timestamp,
            previous_hash: header.previous_hash.clone(),
            merkle_root: Some(header.merkle_root.clone()),
            state_root: Some(header.state_root.clone()),
            hash: Some(header.hash.clone()),
            nonce: header.nonce,
            gas_used: header.gas_used,
            gas_limit: header.gas_limit,
            difficulty: header.difficulty,
            validators: header.validators.clone(),
            stakes: header.stakes.clone(),
            transactions: block.transactions().to_vec(),
            smart_contract_results: block.smart_contract_results().clone(),
            metadata: block.metadata().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksRangeResponse {
    pub blocks: Vec<BlockPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeadersResponse {
    pub headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HasSnapshotResponse {
    pub exists: bool,
}

/// A hard-coded trusted (height, hash, state_root) triple used to bootstrap
/// without replaying history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: BlockHeight,
    pub hash: String,
    pub state_root: Hash,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_height_alias_accepted() {
        let payload: BlockPayload = serde_json::from_value(json!({
            "height": 7,
            "timestamp": 1_700_000_000_000u64,
            "previous_hash": "aa"
        }))
        .unwrap();
        assert_eq!(payload.index, 7);
    }

    #[test]
    fn test_fingerprint_prefers_explicit_hash() {
        let block = crate::block::genesis_block(BTreeMap::new(), 1_700_000_000_000).unwrap();
        let payload = BlockPayload::from(&block);
        assert_eq!(payload.fingerprint(), block.hash().to_hex());
    }

    #[test]
    fn test_fingerprint_fallback_is_stable() {
        let a: BlockPayload = serde_json::from_value(json!({
            "index": 3,
            "timestamp": 5u64,
            "previous_hash": "bb"
        }))
        .unwrap();
        let b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        // sha1 hex is 40 chars
        assert_eq!(a.fingerprint().len(), 40);
    }

    #[test]
    fn test_round_trip_preserves_commitments() {
        let block = crate::block::genesis_block(
            BTreeMap::from([("alice".to_string(), 10u64)]),
            1_700_000_000_000,
        )
        .unwrap();
        let payload = BlockPayload::from(&block);
        let rebuilt = payload.into_block().unwrap();
        assert_eq!(rebuilt.hash(), block.hash());
        assert!(rebuilt.verify().is_ok());
    }
}
