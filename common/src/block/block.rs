// Block record and builder
//
// A block is immutable once built. Extending a block with contract results
// or metadata goes through the builder, which recomputes state_root and
// hash before sealing; nothing mutates a sealed block in place.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{
    block::{
        header::{BlockHeader, BlockHeight, HeaderError, GENESIS_PREVIOUS_HASH},
        merkle::MerkleTree,
    },
    contract::ExecutionResult,
    crypto::{sha256, Address, Hash},
    error::CommonError,
    serializer::to_canonical_bytes,
    time::TimestampMillis,
    transaction::{Transaction, TransactionError},
};

#[derive(Debug, Error)]
pub enum BlockError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("merkle root mismatch at height {height}: expected {expected}, got {actual}")]
    MerkleMismatch {
        height: BlockHeight,
        expected: Hash,
        actual: Hash,
    },
    #[error("state root mismatch at height {height}")]
    StateRootMismatch { height: BlockHeight },
    #[error("gas used {gas_used} exceeds gas limit {gas_limit} at height {height}")]
    GasOverLimit {
        height: BlockHeight,
        gas_used: u64,
        gas_limit: u64,
    },
    #[error("invalid transaction {hash} at height {height}: {source}")]
    InvalidTransaction {
        height: BlockHeight,
        hash: Hash,
        source: TransactionError,
    },
    #[error(transparent)]
    Common(#[from] CommonError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    header: BlockHeader,
    transactions: Vec<Transaction>,
    #[serde(default)]
    smart_contract_results: BTreeMap<Address, ExecutionResult>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

// Canonical input of the state root: contract results, the balance deltas
// the transactions imply, and the block metadata.
#[derive(Serialize)]
struct StateCommitment<'a> {
    contracts: &'a BTreeMap<Address, ExecutionResult>,
    balances: BTreeMap<&'a str, i64>,
    metadata: &'a BTreeMap<String, Value>,
}

/// Compute the state root over contract results, transaction balance
/// deltas (recipient +amount, sender -(amount+fee)) and metadata.
pub fn compute_state_root(
    transactions: &[Transaction],
    contract_results: &BTreeMap<Address, ExecutionResult>,
    metadata: &BTreeMap<String, Value>,
) -> Result<Hash, CommonError> {
    let mut balances: BTreeMap<&str, i64> = BTreeMap::new();
    for tx in transactions {
        *balances.entry(tx.to_address()).or_default() += tx.amount() as i64;
        *balances.entry(tx.from_address()).or_default() -= tx.total_cost() as i64;
    }
    let commitment = StateCommitment {
        contracts: contract_results,
        balances,
        metadata,
    };
    Ok(sha256(&to_canonical_bytes(&commitment)?))
}

impl Block {
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn height(&self) -> BlockHeight {
        self.header.index
    }

    pub fn hash(&self) -> &Hash {
        &self.header.hash
    }

    pub fn previous_hash(&self) -> &str {
        &self.header.previous_hash
    }

    pub fn timestamp(&self) -> TimestampMillis {
        self.header.timestamp
    }

    pub fn merkle_root(&self) -> &Hash {
        &self.header.merkle_root
    }

    pub fn state_root(&self) -> &Hash {
        &self.header.state_root
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn smart_contract_results(&self) -> &BTreeMap<Address, ExecutionResult> {
        &self.smart_contract_results
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn is_genesis(&self) -> bool {
        self.header.is_genesis()
    }

    /// Reassemble a block from wire parts, keeping the carried commitments.
    /// `verify()` is the only arbiter of whether they actually hold.
    pub fn from_raw_parts(
        header: BlockHeader,
        transactions: Vec<Transaction>,
        smart_contract_results: BTreeMap<Address, ExecutionResult>,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        Block {
            header,
            transactions,
            smart_contract_results,
            metadata,
        }
    }

    /// Reopen this block as a builder, dropping the seal. Used when contract
    /// results or metadata must be attached to a block under construction.
    pub fn into_builder(self) -> BlockBuilder {
        BlockBuilder {
            index: self.header.index,
            timestamp: self.header.timestamp,
            previous_hash: self.header.previous_hash,
            nonce: self.header.nonce,
            gas_used: self.header.gas_used,
            gas_limit: self.header.gas_limit,
            difficulty: self.header.difficulty,
            validators: self.header.validators,
            stakes: self.header.stakes,
            transactions: self.transactions,
            smart_contract_results: self.smart_contract_results,
            metadata: self.metadata,
        }
    }

    /// Full structural validation: header hash and merkle root recompute,
    /// state root recomputes, gas stays within the limit, and every
    /// transaction passes its integrity check.
    pub fn verify(&self) -> Result<(), BlockError> {
        self.header.verify_hash()?;

        let leaves: Vec<Hash> = self.transactions.iter().map(|tx| tx.hash().clone()).collect();
        let expected_merkle = MerkleTree::new(leaves).root();
        if expected_merkle != self.header.merkle_root {
            return Err(BlockError::MerkleMismatch {
                height: self.header.index,
                expected: expected_merkle,
                actual: self.header.merkle_root.clone(),
            });
        }

        let expected_state =
            compute_state_root(&self.transactions, &self.smart_contract_results, &self.metadata)?;
        if expected_state != self.header.state_root {
            return Err(BlockError::StateRootMismatch {
                height: self.header.index,
            });
        }

        if self.header.gas_used > self.header.gas_limit {
            return Err(BlockError::GasOverLimit {
                height: self.header.index,
                gas_used: self.header.gas_used,
                gas_limit: self.header.gas_limit,
            });
        }

        for tx in &self.transactions {
            tx.verify_integrity()
                .map_err(|source| BlockError::InvalidTransaction {
                    height: self.header.index,
                    hash: tx.hash().clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Convenience wrapper for callers that only need a yes/no.
    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }
}

pub struct BlockBuilder {
    index: BlockHeight,
    timestamp: TimestampMillis,
    previous_hash: String,
    nonce: u64,
    gas_used: u64,
    gas_limit: u64,
    difficulty: u64,
    validators: Vec<Address>,
    stakes: BTreeMap<Address, u64>,
    transactions: Vec<Transaction>,
    smart_contract_results: BTreeMap<Address, ExecutionResult>,
    metadata: BTreeMap<String, Value>,
}

impl BlockBuilder {
    pub fn new(
        index: BlockHeight,
        transactions: Vec<Transaction>,
        previous_hash: String,
        validators: Vec<Address>,
        stakes: BTreeMap<Address, u64>,
    ) -> Self {
        BlockBuilder {
            index,
            timestamp: crate::time::get_current_time_in_millis(),
            previous_hash,
            nonce: 0,
            gas_used: transactions.iter().map(|tx| tx.gas_used()).sum(),
            gas_limit: crate::config::DEFAULT_BLOCK_GAS_LIMIT,
            difficulty: 1,
            validators,
            stakes,
            transactions,
            smart_contract_results: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: TimestampMillis) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_difficulty(mut self, difficulty: u64) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_gas_used(mut self, gas_used: u64) -> Self {
        self.gas_used = gas_used;
        self
    }

    /// Attach the execution result for a contract address. Charged gas is
    /// accumulated into the block's gas_used.
    pub fn with_contract_result(mut self, address: Address, result: ExecutionResult) -> Self {
        self.gas_used = self.gas_used.saturating_add(result.gas_used);
        self.smart_contract_results.insert(address, result);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn without_metadata(mut self, key: &str) -> Self {
        self.metadata.remove(key);
        self
    }

    /// Seal the block: compute merkle root, state root and hash.
    pub fn build(self) -> Result<Block, BlockError> {
        let leaves: Vec<Hash> = self.transactions.iter().map(|tx| tx.hash().clone()).collect();
        let merkle_root = MerkleTree::new(leaves).root();
        let state_root =
            compute_state_root(&self.transactions, &self.smart_contract_results, &self.metadata)?;

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
        header.hash = header.compute_hash()?;

        Ok(Block {
            header,
            transactions: self.transactions,
            smart_contract_results: self.smart_contract_results,
            metadata: self.metadata,
        })
    }
}

/// Build the genesis block carrying the initial token distribution in its
/// metadata. previous_hash is the "0" sentinel.
pub fn genesis_block(
    distribution: BTreeMap<Address, u64>,
    timestamp: TimestampMillis,
) -> Result<Block, BlockError> {
    let stakes: BTreeMap<Address, u64> = BTreeMap::new();
    BlockBuilder::new(
        0,
        Vec::new(),
        GENESIS_PREVIOUS_HASH.to_string(),
        Vec::new(),
        stakes,
    )
    .with_timestamp(timestamp)
    .with_metadata(
        "distribution",
        serde_json::to_value(distribution).map_err(CommonError::from)?,
    )
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    pub(crate) fn transfer(keypair: &KeyPair, amount: u64, fee: u64, nonce: u64) -> Transaction {
        Transaction::create(
            keypair,
            "recipient".to_string(),
            amount,
            fee,
            nonce,
            21_000,
            1,
            None,
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_build_and_verify() {
        let keypair = KeyPair::generate();
        let txs = vec![transfer(&keypair, 5, 1, 0), transfer(&keypair, 7, 1, 1)];
        let block = BlockBuilder::new(
            1,
            txs.clone(),
            "g".to_string(),
            vec!["validator-a".to_string()],
            BTreeMap::from([("validator-a".to_string(), 100)]),
        )
        .build()
        .unwrap();

        assert_eq!(block.height(), 1);
        assert_eq!(block.previous_hash(), "g");
        let leaves: Vec<Hash> = txs.iter().map(|tx| tx.hash().clone()).collect();
        assert_eq!(*block.merkle_root(), MerkleTree::new(leaves).root());
        assert!(block.verify().is_ok());
    }

    #[test]
    fn test_empty_block_merkle_root() {
        let block = BlockBuilder::new(1, Vec::new(), "g".to_string(), Vec::new(), BTreeMap::new())
            .build()
            .unwrap();
        assert_eq!(*block.merkle_root(), MerkleTree::empty_root());
        assert!(block.verify().is_ok());
    }

    #[test]
    fn test_contract_result_changes_roots() {
        let base = BlockBuilder::new(1, Vec::new(), "g".to_string(), Vec::new(), BTreeMap::new())
            .build()
            .unwrap();
        let extended = base
            .clone()
            .into_builder()
            .with_contract_result(
                "contract-1".to_string(),
                ExecutionResult {
                    success: true,
                    gas_used: 400,
                    state_changes: BTreeMap::new(),
                    logs: vec![],
                },
            )
            .build()
            .unwrap();

        assert_ne!(base.state_root(), extended.state_root());
        assert_ne!(base.hash(), extended.hash());
        assert!(extended.verify().is_ok());
    }

    #[test]
    fn test_gas_over_limit_rejected() {
        let block = BlockBuilder::new(1, Vec::new(), "g".to_string(), Vec::new(), BTreeMap::new())
            .with_gas_limit(100)
            .with_gas_used(101)
            .build()
            .unwrap();
        assert!(matches!(
            block.verify(),
            Err(BlockError::GasOverLimit { .. })
        ));
    }

    #[test]
    fn test_genesis_shape() {
        let block = genesis_block(
            BTreeMap::from([("alice".to_string(), 1_000u64)]),
            1_700_000_000_000,
        )
        .unwrap();
        assert!(block.is_genesis());
        assert_eq!(block.previous_hash(), GENESIS_PREVIOUS_HASH);
        assert!(block.verify().is_ok());
    }
}
