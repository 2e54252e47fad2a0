// Chain manager
//
// Owns chain assembly and the derived state: balances, nonces, stakeholders
// and the pending pool. Writers serialize on a single chain lock so the tip
// only ever advances monotonically; readers see the in-memory state behind
// a short-lived RwLock never held across I/O.

use log::{debug, info, warn};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::{broadcast, Mutex, RwLock};

use stratos_common::{
    api::SnapshotDocument,
    block::{Block, BlockBuilder, BlockHeight},
    config::DEFAULT_MAX_TX_PER_BLOCK,
    contract::{ContractRuntime, ExecutionContext, ExecutionResult},
    crypto::{Address, Hash, KeyPair},
    time::{get_current_time_in_millis, TimestampMillis},
    transaction::{Transaction, TransactionError, TransactionStatus},
};

use crate::core::{
    consensus::Consensus,
    error::BlockchainError,
    mempool::Mempool,
    storage::Storage,
};

/// Chain notifications fanned out to the propagation layer.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    BlockAdded(Arc<Block>),
    TransactionAdded(Arc<Transaction>),
}

#[derive(Debug, Clone)]
pub struct TipInfo {
    pub height: BlockHeight,
    pub hash_hex: String,
    pub timestamp: TimestampMillis,
}

#[derive(Default, Clone)]
struct ChainState {
    tip: Option<TipInfo>,
    balances: HashMap<Address, u64>,
    nonces: HashMap<Address, u64>,
    stakeholders: BTreeMap<Address, u64>,
    // set when the base was adopted from a bare checkpoint: account state is
    // unknown there, so per-tx spendability cannot be enforced
    trusted_base: bool,
}

impl ChainState {
    // Fold one confirmed block into the derived maps.
    fn apply_block(&mut self, block: &Block) {
        if block.is_genesis() {
            if let Some(distribution) = block
                .metadata()
                .get("distribution")
                .and_then(|value| value.as_object())
            {
                for (address, amount) in distribution {
                    if let Some(amount) = amount.as_u64() {
                        *self.balances.entry(address.clone()).or_default() += amount;
                    }
                }
            }
        }

        for tx in block.transactions() {
            let debit = tx.total_cost();
            let sender = self.balances.entry(tx.from_address().clone()).or_default();
            *sender = sender.saturating_sub(debit);
            *self.balances.entry(tx.to_address().clone()).or_default() += tx.amount();
            *self.nonces.entry(tx.from_address().clone()).or_default() += 1;

            // a transfer flagged as a stake deposit locks its amount as stake
            if tx
                .data()
                .and_then(|data| data.get("stake"))
                .and_then(|value| value.as_bool())
                .unwrap_or(false)
            {
                *self
                    .stakeholders
                    .entry(tx.from_address().clone())
                    .or_default() += tx.amount();
            }
            if let Some(unstake) = tx
                .data()
                .and_then(|data| data.get("unstake"))
                .and_then(|value| value.as_u64())
            {
                if let Some(stake) = self.stakeholders.get_mut(tx.from_address()) {
                    *stake = stake.saturating_sub(unstake);
                }
            }
        }
        // zero stakes are dropped from the map
        self.stakeholders.retain(|_, stake| *stake > 0);

        self.tip = Some(TipInfo {
            height: block.height(),
            hash_hex: block.hash().to_hex(),
            timestamp: block.timestamp(),
        });
    }
}

pub struct Blockchain<S: Storage> {
    storage: Arc<RwLock<S>>,
    consensus: Arc<dyn Consensus>,
    runtime: Arc<dyn ContractRuntime>,
    // single-writer chain lock: spans validate + persist + state update
    chain_lock: Mutex<()>,
    state: RwLock<ChainState>,
    // state adopted from a verified snapshot; replays resume from here
    snapshot_base: RwLock<Option<ChainState>>,
    mempool: RwLock<Mempool>,
    events: broadcast::Sender<ChainEvent>,
    max_tx_per_block: usize,
}

impl<S: Storage> Blockchain<S> {
    pub async fn new(
        storage: Arc<RwLock<S>>,
        consensus: Arc<dyn Consensus>,
        runtime: Arc<dyn ContractRuntime>,
        mempool_capacity: usize,
    ) -> Result<Self, BlockchainError> {
        let (events, _) = broadcast::channel(256);
        let chain = Blockchain {
            storage,
            consensus,
            runtime,
            chain_lock: Mutex::new(()),
            state: RwLock::new(ChainState::default()),
            snapshot_base: RwLock::new(None),
            mempool: RwLock::new(Mempool::new(mempool_capacity)),
            events,
            max_tx_per_block: DEFAULT_MAX_TX_PER_BLOCK,
        };
        chain.rebuild_state().await?;

        // recover the pending pool mirror
        let pending = chain.storage.read().await.load_mempool().await?;
        if !pending.is_empty() {
            info!("restoring {} pending transactions", pending.len());
            let mut mempool = chain.mempool.write().await;
            for tx in pending {
                mempool.insert(tx);
            }
        }
        Ok(chain)
    }

    pub fn storage(&self) -> &Arc<RwLock<S>> {
        &self.storage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    // Replay stored blocks into a fresh in-memory state. Fast-synced nodes
    // resume from the adopted snapshot base; replay only folds in blocks
    // above it.
    async fn rebuild_state(&self) -> Result<(), BlockchainError> {
        let base = self.snapshot_base.read().await.clone();
        let replay_from = base
            .as_ref()
            .and_then(|state| state.tip.as_ref())
            .map(|tip| tip.height + 1)
            .unwrap_or(0);
        let mut fresh = base.unwrap_or_default();

        let storage = self.storage.read().await;
        let count = storage.count_blocks().await?;
        for height in replay_from..count {
            if let Some(block) = storage.get_block_by_height(height).await? {
                fresh.apply_block(&block);
            }
        }
        drop(storage);

        let mut state = self.state.write().await;
        *state = fresh;
        if let Some(tip) = &state.tip {
            info!("chain state rebuilt, tip at height {}", tip.height);
        }
        Ok(())
    }

    pub async fn tip(&self) -> Option<TipInfo> {
        self.state.read().await.tip.clone()
    }

    /// Local chain height; None before genesis.
    pub async fn height(&self) -> Option<BlockHeight> {
        self.state.read().await.tip.as_ref().map(|tip| tip.height)
    }

    pub async fn get_balance(&self, address: &str) -> u64 {
        self.state
            .read()
            .await
            .balances
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub async fn expected_nonce(&self, address: &str) -> u64 {
        self.state
            .read()
            .await
            .nonces
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub async fn stakeholders(&self) -> BTreeMap<Address, u64> {
        self.state.read().await.stakeholders.clone()
    }

    /// Naive audit fold over every stored block; the incremental map above
    /// is the fast path, this is the ground truth.
    pub async fn audit_balance(&self, address: &str) -> Result<u64, BlockchainError> {
        let storage = self.storage.read().await;
        let count = storage.count_blocks().await?;
        let mut balance: i128 = 0;
        for height in 0..count {
            let Some(block) = storage.get_block_by_height(height).await? else {
                continue;
            };
            if block.is_genesis() {
                if let Some(amount) = block
                    .metadata()
                    .get("distribution")
                    .and_then(|value| value.get(address))
                    .and_then(|value| value.as_u64())
                {
                    balance += amount as i128;
                }
            }
            for tx in block.transactions() {
                if tx.to_address() == address {
                    balance += tx.amount() as i128;
                }
                if tx.from_address() == address {
                    balance -= tx.total_cost() as i128;
                }
            }
        }
        Ok(balance.max(0) as u64)
    }

    /// Append a block to the chain. Rejects anything that does not extend
    /// the tip with a valid, consensus-approved block; rejection leaves no
    /// state change.
    pub async fn add_block(&self, block: Block) -> Result<(), BlockchainError> {
        let _guard = self.chain_lock.lock().await;

        // continuity against the current tip
        {
            let state = self.state.read().await;
            match &state.tip {
                None => {
                    if !block.is_genesis() {
                        return Err(BlockchainError::GenesisRequired);
                    }
                }
                Some(tip) => {
                    if block.height() != tip.height + 1 {
                        return Err(BlockchainError::NonSequentialBlock {
                            tip: tip.height,
                            actual: block.height(),
                        });
                    }
                    if block.previous_hash() != tip.hash_hex {
                        return Err(BlockchainError::BrokenChainLink {
                            height: block.height(),
                            expected: tip.hash_hex.clone(),
                        });
                    }
                    if block.timestamp() <= tip.timestamp {
                        return Err(BlockchainError::TimestampNotMonotonic);
                    }
                }
            }

            block.verify()?;
            self.consensus.validate_block(&block, &state.stakeholders)?;

            // transactions must be spendable in order against current state
            let mut balances = state.balances.clone();
            let mut nonces = state.nonces.clone();
            if block.is_genesis() {
                if let Some(distribution) = block
                    .metadata()
                    .get("distribution")
                    .and_then(|value| value.as_object())
                {
                    for (address, amount) in distribution {
                        if let Some(amount) = amount.as_u64() {
                            *balances.entry(address.clone()).or_default() += amount;
                        }
                    }
                }
            }
            if !state.trusted_base {
                for tx in block.transactions() {
                    let expected = nonces.get(tx.from_address()).copied().unwrap_or(0);
                    let balance = balances.get(tx.from_address()).copied().unwrap_or(0);
                    tx.verify_spendable(expected, balance)?;
                    *balances.entry(tx.from_address().clone()).or_default() -= tx.total_cost();
                    *balances.entry(tx.to_address().clone()).or_default() += tx.amount();
                    *nonces.entry(tx.from_address().clone()).or_default() += 1;
                }
            }
        }

        // durable before the in-memory state moves
        self.storage.write().await.save_block(&block).await?;

        {
            let mut state = self.state.write().await;
            state.apply_block(&block);
        }

        // rebuild the pending pool minus what just confirmed
        let confirmed: Vec<Hash> = block
            .transactions()
            .iter()
            .map(|tx| tx.hash().clone())
            .collect();
        if !confirmed.is_empty() {
            let removed = self.mempool.write().await.remove_confirmed(confirmed.clone());
            debug!("block {} cleared {} pooled transactions", block.height(), removed);
            let mut storage = self.storage.write().await;
            for hash in &confirmed {
                storage.remove_mempool_tx(&hash.to_hex()).await?;
            }
        }

        info!(
            "block {} accepted at height {} with {} transactions",
            block.hash(),
            block.height(),
            block.transactions().len()
        );
        let _ = self.events.send(ChainEvent::BlockAdded(Arc::new(block)));
        Ok(())
    }

    /// Mint a block from the pending pool. Returns None when the validator
    /// is not permitted or there is nothing to mint.
    pub async fn create_block(
        &self,
        keypair: &KeyPair,
    ) -> Result<Option<Block>, BlockchainError> {
        let validator = keypair.address();
        let (tip, stakeholders, balances) = {
            let state = self.state.read().await;
            (
                state.tip.clone(),
                state.stakeholders.clone(),
                state.balances.clone(),
            )
        };
        if !self.consensus.can_validate(&validator, &stakeholders) {
            debug!("validator {} not permitted to mint", validator);
            return Ok(None);
        }

        let mut selected = self.mempool.read().await.select(self.max_tx_per_block);
        if selected.is_empty() {
            return Ok(None);
        }
        for tx in &mut selected {
            tx.set_status(TransactionStatus::Confirmed);
        }

        let (height, previous_hash, min_timestamp) = match &tip {
            Some(tip) => (tip.height + 1, tip.hash_hex.clone(), tip.timestamp + 1),
            None => return Err(BlockchainError::GenesisRequired),
        };

        // run contract calls against a read-only context; failures confirm
        // as unsuccessful results consuming their declared gas limit
        let mut contract_results: BTreeMap<Address, ExecutionResult> = BTreeMap::new();
        for tx in &selected {
            let Some(bytecode_hex) = tx
                .data()
                .and_then(|data| data.get("bytecode"))
                .and_then(|value| value.as_str())
            else {
                continue;
            };
            let contract = tx.to_address().clone();
            let result = match hex::decode(bytecode_hex) {
                Ok(bytecode) => {
                    let balance_of =
                        |address: &Address| balances.get(address).copied().unwrap_or(0);
                    let ctx = ExecutionContext {
                        caller: tx.from_address().clone(),
                        contract: contract.clone(),
                        gas_limit: tx.gas_limit(),
                        gas_price: tx.gas_price(),
                        block_height: height,
                        input: tx.data().and_then(|data| data.get("input")),
                        balance_of: &balance_of,
                    };
                    self.runtime.execute(&bytecode, &ctx)
                }
                Err(_) => ExecutionResult::failure(tx.gas_limit(), "invalid bytecode"),
            };
            if !result.success {
                warn!(
                    "contract {} failed in block {}, charging {} gas",
                    contract, height, result.gas_used
                );
            }
            contract_results.insert(contract, result);
        }

        let mut builder = BlockBuilder::new(
            height,
            selected,
            previous_hash,
            vec![validator.clone()],
            stakeholders,
        )
        .with_timestamp(get_current_time_in_millis().max(min_timestamp));
        for (contract, result) in contract_results {
            builder = builder.with_contract_result(contract, result);
        }

        let block = builder.build()?;
        let sealed = self.consensus.sign_block(block, keypair)?;
        Ok(Some(sealed))
    }

    /// Validate and pool a transaction, then notify the propagation layer.
    pub async fn add_transaction(&self, tx: Transaction) -> Result<(), BlockchainError> {
        tx.verify_integrity()?;

        {
            let state = self.state.read().await;
            let mempool = self.mempool.read().await;
            if mempool.contains(tx.hash()) {
                return Err(BlockchainError::DuplicateTransaction(tx.hash().to_hex()));
            }
            if mempool.is_full() {
                return Err(BlockchainError::MempoolFull);
            }

            // projected balance: confirmed balance minus what the pool
            // already commits for this sender
            let balance = state
                .balances
                .get(tx.from_address())
                .copied()
                .unwrap_or(0);
            let committed = mempool.pending_spend_of(tx.from_address());
            let available = balance.saturating_sub(committed);
            if tx.total_cost() > available {
                return Err(TransactionError::InsufficientFunds {
                    balance: available,
                    required: tx.total_cost(),
                }
                .into());
            }
        }

        self.mempool.write().await.insert(tx.clone());
        self.storage.write().await.store_mempool_tx(&tx).await?;
        debug!("transaction {} pooled", tx.hash());
        let _ = self
            .events
            .send(ChainEvent::TransactionAdded(Arc::new(tx)));
        Ok(())
    }

    /// Linear walk asserting per-block validity and link continuity over
    /// the stored span (fast-synced chains start above genesis).
    pub async fn is_chain_valid(&self) -> Result<bool, BlockchainError> {
        let storage = self.storage.read().await;
        let count = storage.count_blocks().await?;
        let mut previous: Option<Block> = None;
        for height in 0..count {
            let Some(block) = storage.get_block_by_height(height).await? else {
                // below the snapshot base nothing is stored
                continue;
            };
            if block.verify().is_err() {
                return Ok(false);
            }
            if let Some(prev) = &previous {
                if block.previous_hash() != prev.hash().to_hex()
                    || block.timestamp() <= prev.timestamp()
                {
                    return Ok(false);
                }
            } else if block.height() == 0 && !block.is_genesis() {
                return Ok(false);
            }
            previous = Some(block);
        }
        Ok(true)
    }

    /// Rewind the chain to `height` (exclusive of removed blocks), giving
    /// back the orphaned blocks newest first. Genesis is never rewound.
    pub async fn rewind_to(&self, height: BlockHeight) -> Result<Vec<Block>, BlockchainError> {
        let _guard = self.chain_lock.lock().await;
        let removed = self.storage.write().await.truncate_from(height).await?;
        if !removed.is_empty() {
            warn!("rewound {} blocks to height {}", removed.len(), height);
            self.rebuild_state().await?;
        }
        Ok(removed)
    }

    /// Return transactions from abandoned branch blocks to the pool for
    /// reconsideration, skipping any that no longer apply.
    pub async fn restore_orphaned_transactions(&self, blocks: &[Block]) -> usize {
        let mut restored = 0;
        for block in blocks {
            for tx in block.transactions() {
                let mut tx = tx.clone();
                tx.set_status(TransactionStatus::Pending);
                let expected = self.expected_nonce(tx.from_address()).await;
                if tx.nonce() < expected {
                    // already replayed on the canonical branch
                    continue;
                }
                if self.add_transaction(tx).await.is_ok() {
                    restored += 1;
                }
            }
        }
        restored
    }

    /// Adopt a verified state snapshot: replaces the derived state and sets
    /// a synthetic tip so the next block must extend the snapshot block.
    pub async fn load_snapshot(
        &self,
        snapshot: &SnapshotDocument,
    ) -> Result<(), BlockchainError> {
        let _guard = self.chain_lock.lock().await;
        let mut state = self.state.write().await;

        let mut fresh = ChainState {
            tip: Some(TipInfo {
                height: snapshot.metadata.height,
                hash_hex: snapshot.metadata.block_hash.clone(),
                // unknown block time: accept any strictly positive successor
                timestamp: 0,
            }),
            ..ChainState::default()
        };
        for (address, account) in &snapshot.state.accounts {
            fresh.balances.insert(address.clone(), account.balance);
            fresh.nonces.insert(address.clone(), account.nonce);
            if account.stake > 0 {
                fresh.stakeholders.insert(address.clone(), account.stake);
            }
        }
        for (address, stake) in &snapshot.state.validators {
            if *stake > 0 {
                fresh.stakeholders.insert(address.clone(), *stake);
            }
        }
        *self.snapshot_base.write().await = Some(fresh.clone());
        *state = fresh;
        info!(
            "state snapshot applied at height {} ({} accounts)",
            snapshot.metadata.height,
            snapshot.state.accounts.len()
        );
        Ok(())
    }

    /// Bootstrap from a trusted checkpoint: the tip is taken on faith and
    /// account state stays unknown, so spendability checks are suspended
    /// for blocks building on this base.
    pub async fn adopt_checkpoint(
        &self,
        checkpoint: &stratos_common::api::Checkpoint,
    ) -> Result<(), BlockchainError> {
        let _guard = self.chain_lock.lock().await;
        let fresh = ChainState {
            tip: Some(TipInfo {
                height: checkpoint.height,
                hash_hex: checkpoint.hash.clone(),
                timestamp: 0,
            }),
            trusted_base: true,
            ..ChainState::default()
        };
        *self.snapshot_base.write().await = Some(fresh.clone());
        *self.state.write().await = fresh;
        warn!(
            "adopted checkpoint at height {}; account-level validation suspended",
            checkpoint.height
        );
        Ok(())
    }

    /// Export the current derived state for snapshotting.
    pub async fn export_state(&self) -> stratos_common::api::SnapshotState {
        use stratos_common::api::{AccountState, SnapshotState};
        let state = self.state.read().await;
        let mut accounts: BTreeMap<Address, AccountState> = BTreeMap::new();
        for (address, balance) in &state.balances {
            accounts.entry(address.clone()).or_default().balance = *balance;
        }
        for (address, nonce) in &state.nonces {
            accounts.entry(address.clone()).or_default().nonce = *nonce;
        }
        for (address, stake) in &state.stakeholders {
            accounts.entry(address.clone()).or_default().stake = *stake;
        }
        SnapshotState {
            accounts,
            contracts: BTreeMap::new(),
            validators: state.stakeholders.clone(),
            governance: BTreeMap::new(),
            height: state.tip.as_ref().map(|tip| tip.height).unwrap_or(0),
        }
    }

    // --- mempool views ---

    pub async fn mempool_len(&self) -> usize {
        self.mempool.read().await.len()
    }

    pub async fn pending_transactions(&self, limit: usize) -> Vec<Transaction> {
        self.mempool.read().await.select(limit)
    }

    pub async fn mempool_old_tx_count(&self, cutoff: TimestampMillis) -> usize {
        self.mempool.read().await.count_older_than(cutoff)
    }

    /// Purge pool entries older than `cutoff`, mirroring the removals.
    pub async fn purge_old_mempool(&self, cutoff: TimestampMillis) -> usize {
        let purged = self.mempool.write().await.purge_older_than(cutoff);
        if purged.is_empty() {
            return 0;
        }
        let mut storage = self.storage.write().await;
        for tx in &purged {
            if let Err(error) = storage.remove_mempool_tx(&tx.hash().to_hex()).await {
                warn!("failed to drop mirrored mempool tx: {}", error);
            }
        }
        purged.len()
    }

    pub async fn count_blocks(&self) -> Result<u64, BlockchainError> {
        self.storage.read().await.count_blocks().await
    }

    pub async fn get_block_by_height(
        &self,
        height: BlockHeight,
    ) -> Result<Option<Block>, BlockchainError> {
        self.storage.read().await.get_block_by_height(height).await
    }

    pub async fn get_block_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<Block>, BlockchainError> {
        self.storage.read().await.get_block_by_hash(hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{consensus::ProofOfStake, storage::SledStorage};
    use stratos_common::{block::genesis_block, contract::NoopRuntime};

    pub(crate) async fn test_chain(
        distribution: &[(&KeyPair, u64)],
    ) -> Arc<Blockchain<SledStorage>> {
        let storage = Arc::new(RwLock::new(SledStorage::temporary().unwrap()));
        let chain = Blockchain::new(
            storage,
            Arc::new(ProofOfStake),
            Arc::new(NoopRuntime),
            1000,
        )
        .await
        .unwrap();

        let distribution: BTreeMap<Address, u64> = distribution
            .iter()
            .map(|(keypair, amount)| (keypair.address(), *amount))
            .collect();
        let genesis = genesis_block(distribution, 1_700_000_000_000).unwrap();
        chain.add_block(genesis).await.unwrap();
        Arc::new(chain)
    }

    fn transfer(keypair: &KeyPair, to: &str, amount: u64, fee: u64, nonce: u64) -> Transaction {
        Transaction::create(
            keypair,
            to.to_string(),
            amount,
            fee,
            nonce,
            21_000,
            1,
            None,
            get_current_time_in_millis(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_genesis_required_first() {
        let storage = Arc::new(RwLock::new(SledStorage::temporary().unwrap()));
        let chain = Blockchain::new(
            storage,
            Arc::new(ProofOfStake),
            Arc::new(NoopRuntime),
            1000,
        )
        .await
        .unwrap();

        let stray = BlockBuilder::new(1, Vec::new(), "x".to_string(), Vec::new(), BTreeMap::new())
            .build()
            .unwrap();
        assert!(matches!(
            chain.add_block(stray).await,
            Err(BlockchainError::GenesisRequired)
        ));
    }

    #[tokio::test]
    async fn test_mint_and_apply_updates_balances() {
        let alice = KeyPair::generate();
        let chain = test_chain(&[(&alice, 100)]).await;

        chain
            .add_transaction(transfer(&alice, "recipient-1", 5, 1, 0))
            .await
            .unwrap();
        chain
            .add_transaction(transfer(&alice, "recipient-2", 7, 1, 1))
            .await
            .unwrap();
        assert_eq!(chain.mempool_len().await, 2);

        let block = chain.create_block(&alice).await.unwrap().unwrap();
        assert_eq!(block.transactions().len(), 2);
        chain.add_block(block).await.unwrap();

        assert_eq!(chain.mempool_len().await, 0);
        assert_eq!(chain.get_balance("recipient-1").await, 5);
        assert_eq!(chain.get_balance("recipient-2").await, 7);
        // 100 - (5+1) - (7+1)
        assert_eq!(chain.get_balance(&alice.address()).await, 86);
        assert_eq!(chain.expected_nonce(&alice.address()).await, 2);
        assert!(chain.is_chain_valid().await.unwrap());

        // incremental map agrees with the audit fold
        assert_eq!(
            chain.audit_balance(&alice.address()).await.unwrap(),
            chain.get_balance(&alice.address()).await
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_link_and_height() {
        let alice = KeyPair::generate();
        let chain = test_chain(&[(&alice, 100)]).await;
        let tip = chain.tip().await.unwrap();

        let skipped = BlockBuilder::new(
            5,
            Vec::new(),
            tip.hash_hex.clone(),
            Vec::new(),
            BTreeMap::new(),
        )
        .with_timestamp(tip.timestamp + 1)
        .build()
        .unwrap();
        assert!(matches!(
            chain.add_block(skipped).await,
            Err(BlockchainError::NonSequentialBlock { .. })
        ));

        let unlinked =
            BlockBuilder::new(1, Vec::new(), "bogus".to_string(), Vec::new(), BTreeMap::new())
                .with_timestamp(tip.timestamp + 1)
                .build()
                .unwrap();
        assert!(matches!(
            chain.add_block(unlinked).await,
            Err(BlockchainError::BrokenChainLink { .. })
        ));

        let stale = BlockBuilder::new(
            1,
            Vec::new(),
            tip.hash_hex.clone(),
            Vec::new(),
            BTreeMap::new(),
        )
        .with_timestamp(tip.timestamp)
        .build()
        .unwrap();
        assert!(matches!(
            chain.add_block(stale).await,
            Err(BlockchainError::TimestampNotMonotonic)
        ));

        // nothing changed
        assert_eq!(chain.height().await, Some(0));
    }

    #[tokio::test]
    async fn test_overdraft_rejected_against_projected_balance() {
        let alice = KeyPair::generate();
        let chain = test_chain(&[(&alice, 10)]).await;

        chain
            .add_transaction(transfer(&alice, "r1", 8, 1, 0))
            .await
            .unwrap();
        // 8+1 committed, only 1 left: 5+1 must be refused
        let error = chain
            .add_transaction(transfer(&alice, "r2", 5, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            BlockchainError::InvalidTransaction(TransactionError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_stake_deposit_registers_stakeholder() {
        let alice = KeyPair::generate();
        let chain = test_chain(&[(&alice, 100)]).await;

        let stake = Transaction::create(
            &alice,
            alice.address(),
            40,
            1,
            0,
            21_000,
            1,
            Some(serde_json::json!({"stake": true})),
            get_current_time_in_millis(),
        )
        .unwrap();
        chain.add_transaction(stake).await.unwrap();
        let block = chain.create_block(&alice).await.unwrap().unwrap();
        chain.add_block(block).await.unwrap();

        let stakeholders = chain.stakeholders().await;
        assert_eq!(stakeholders.get(&alice.address()), Some(&40));
    }

    #[tokio::test]
    async fn test_rewind_restores_orphaned_transactions() {
        let alice = KeyPair::generate();
        let chain = test_chain(&[(&alice, 100)]).await;

        chain
            .add_transaction(transfer(&alice, "r1", 5, 1, 0))
            .await
            .unwrap();
        let block = chain.create_block(&alice).await.unwrap().unwrap();
        chain.add_block(block).await.unwrap();
        assert_eq!(chain.height().await, Some(1));

        let removed = chain.rewind_to(1).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(chain.height().await, Some(0));
        assert_eq!(chain.get_balance(&alice.address()).await, 100);

        let restored = chain.restore_orphaned_transactions(&removed).await;
        assert_eq!(restored, 1);
        assert_eq!(chain.mempool_len().await, 1);
    }
}
