// Chain synchronization engine
//
// A sync attempt walks Idle -> ChoosingStrategy -> Downloading ->
// Validating -> Applied (or Failed). Bulk downloads fan ranged GETs out to
// several peers in parallel, resolve disagreements by per-height plurality
// over payload fingerprints, truncate at the first continuity break and
// apply through the chain manager, stopping at the first rejection. Every
// attempt carries a deadline; exceeding it aborts with the chain left at
// the highest contiguously applied block.

use futures::future::join_all;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};
use tokio::sync::RwLock;

use stratos_common::{
    api::{BlockPayload, Checkpoint},
    block::{verify_header_chain, Block, BlockHeader, BlockHeight},
    crypto::Hash,
};

use crate::{
    config::FULL_SYNC_THRESHOLD,
    core::{
        blockchain::Blockchain,
        error::BlockchainError,
        snapshot::{compute_snapshot_state_root, SnapshotManager},
        storage::Storage,
    },
    p2p::{
        adaptive_timeout,
        client::PeerClient,
        error::P2pError,
        load_balancer::LoadBalancer,
        peer_list::PeerRegistry,
        rate_limiter::{RateDecision, RateLimiter, SyncKind},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    Full,
    Fast,
    Light,
    Checkpoint,
}

/// Strategy table: a pure function of the two heights and checkpoint
/// availability. Light sync is chosen only on explicit request.
pub fn choose_strategy(
    local: BlockHeight,
    network: BlockHeight,
    has_checkpoints: bool,
    fast_sync_threshold: u64,
) -> SyncStrategy {
    if local == 0 && has_checkpoints {
        return SyncStrategy::Checkpoint;
    }
    let delta = network.saturating_sub(local);
    if delta < FULL_SYNC_THRESHOLD {
        SyncStrategy::Full
    } else if delta < fast_sync_threshold {
        SyncStrategy::Fast
    } else if has_checkpoints {
        SyncStrategy::Checkpoint
    } else {
        SyncStrategy::Fast
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    ChoosingStrategy,
    Downloading,
    Validating,
    Applied,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub strategy: Option<SyncStrategy>,
    pub start_height: BlockHeight,
    pub target_height: BlockHeight,
    pub applied: u64,
}

/// Resolve competing payloads for one height: the fingerprint with the
/// most supporting peers wins (plurality).
pub fn pick_by_plurality(candidates: Vec<BlockPayload>) -> Option<BlockPayload> {
    let mut support: HashMap<String, (usize, BlockPayload)> = HashMap::new();
    for payload in candidates {
        let fingerprint = payload.fingerprint();
        support
            .entry(fingerprint)
            .and_modify(|(count, _)| *count += 1)
            .or_insert((1, payload));
    }
    support
        .into_values()
        .max_by_key(|(count, _)| *count)
        .map(|(_, payload)| payload)
}

/// Truncate a height-ordered run of blocks at the first broken link.
pub fn truncate_contiguous(blocks: Vec<Block>) -> Vec<Block> {
    let mut contiguous: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let Some(previous) = contiguous.last() {
            if block.previous_hash() != previous.hash().to_hex() {
                warn!(
                    "continuity break at height {}: dropping the tail",
                    block.height()
                );
                break;
            }
        }
        contiguous.push(block);
    }
    contiguous
}

pub struct SyncSettings {
    pub batch_block_size: u64,
    pub parallel_downloads: usize,
    pub state_snapshot_size: u64,
    pub fast_sync_threshold: u64,
    pub max_sync_time_secs: u64,
    pub base_timeout_ms: u64,
    pub adaptive_timeouts: bool,
}

pub struct SyncEngine<S: Storage> {
    chain: Arc<Blockchain<S>>,
    registry: Arc<PeerRegistry>,
    client: Arc<PeerClient>,
    balancer: Arc<LoadBalancer>,
    limiter: Arc<RateLimiter<S>>,
    snapshots: Arc<SnapshotManager>,
    checkpoints: Vec<Checkpoint>,
    phase: RwLock<SyncPhase>,
    settings: SyncSettings,
}

impl<S: Storage> SyncEngine<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<Blockchain<S>>,
        registry: Arc<PeerRegistry>,
        client: Arc<PeerClient>,
        balancer: Arc<LoadBalancer>,
        limiter: Arc<RateLimiter<S>>,
        snapshots: Arc<SnapshotManager>,
        checkpoints: Vec<Checkpoint>,
        settings: SyncSettings,
    ) -> Self {
        SyncEngine {
            chain,
            registry,
            client,
            balancer,
            limiter,
            snapshots,
            checkpoints,
            phase: RwLock::new(SyncPhase::Idle),
            settings,
        }
    }

    pub async fn phase(&self) -> SyncPhase {
        *self.phase.read().await
    }

    async fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write().await = phase;
    }

    /// Synchronize toward the observed network height. A no-op success when
    /// the local chain is already there.
    pub async fn sync_to(&self, network: BlockHeight) -> Result<SyncReport, BlockchainError> {
        let local = self.chain.height().await.unwrap_or(0);
        if local >= network {
            return Ok(SyncReport {
                strategy: None,
                start_height: local,
                target_height: network,
                applied: 0,
            });
        }

        self.set_phase(SyncPhase::ChoosingStrategy).await;
        let strategy = choose_strategy(
            local,
            network,
            !self.checkpoints.is_empty(),
            self.settings.fast_sync_threshold,
        );
        info!(
            "sync attempt: local {} -> network {} via {:?}",
            local, network, strategy
        );

        let deadline = Instant::now()
            + std::time::Duration::from_secs(self.settings.max_sync_time_secs);
        let result = match strategy {
            SyncStrategy::Full => self.download_and_apply(local + 1, network, deadline).await,
            SyncStrategy::Fast => self.fast_sync(local, network, deadline).await,
            SyncStrategy::Checkpoint => self.checkpoint_sync(network, deadline).await,
            // light sync is an explicit request, never auto-chosen
            SyncStrategy::Light => unreachable!("light sync is on-demand only"),
        };

        match result {
            Ok(applied) => {
                self.set_phase(SyncPhase::Applied).await;
                let report = SyncReport {
                    strategy: Some(strategy),
                    start_height: local,
                    target_height: network,
                    applied,
                };
                info!(
                    "sync applied {} blocks ({} -> {})",
                    report.applied,
                    report.start_height,
                    self.chain.height().await.unwrap_or(0)
                );
                self.set_phase(SyncPhase::Idle).await;
                Ok(report)
            }
            Err(error) => {
                self.set_phase(SyncPhase::Failed).await;
                // integrity trouble retries later against a different peer set
                if matches!(
                    error,
                    BlockchainError::SnapshotVerification(_)
                        | BlockchainError::HeaderChain(_)
                        | BlockchainError::SyncDeadlineExceeded(_)
                ) {
                    let _ = self
                        .limiter
                        .enqueue(
                            SyncKind::BlockSync,
                            serde_json::json!({ "target": network }),
                            None,
                            2,
                            60_000,
                        )
                        .await;
                }
                self.set_phase(SyncPhase::Idle).await;
                Err(error)
            }
        }
    }

    /// Bulk-download `[start, end]` in batches and apply through the chain
    /// manager. Returns the number of blocks applied.
    pub async fn download_and_apply(
        &self,
        start: BlockHeight,
        end: BlockHeight,
        deadline: Instant,
    ) -> Result<u64, BlockchainError> {
        let mut applied = 0u64;
        let mut cursor = start;

        while cursor <= end {
            if Instant::now() >= deadline {
                return Err(BlockchainError::SyncDeadlineExceeded(format!(
                    "at height {} of {}",
                    cursor, end
                )));
            }
            let batch_end = (cursor + self.settings.batch_block_size - 1).min(end);

            self.set_phase(SyncPhase::Downloading).await;
            let payloads = self.download_batch(cursor, batch_end).await?;
            if payloads.is_empty() {
                debug!("no payloads for [{}, {}], stopping", cursor, batch_end);
                break;
            }

            self.set_phase(SyncPhase::Validating).await;
            let mut blocks = Vec::with_capacity(payloads.len());
            for payload in payloads {
                blocks.push(payload.into_block()?);
            }
            let blocks = truncate_contiguous(blocks);
            let truncated = blocks.is_empty();

            let mut rejected = false;
            for block in blocks {
                let height = block.height();
                match self.chain.add_block(block).await {
                    Ok(()) => applied += 1,
                    Err(error) => {
                        warn!("sync stopped at height {}: {}", height, error);
                        rejected = true;
                        break;
                    }
                }
            }
            if rejected || truncated {
                break;
            }
            cursor = batch_end + 1;
        }
        Ok(applied)
    }

    // One batch: parallel ranged GETs against eligible peers, plurality per
    // height, ascending result. Falls back to per-block GETs when no peer
    // serves the range endpoint.
    async fn download_batch(
        &self,
        start: BlockHeight,
        end: BlockHeight,
    ) -> Result<Vec<BlockPayload>, BlockchainError> {
        let mut eligible = Vec::new();
        for peer in self.registry.active_peers() {
            if self.registry.is_suppressed(&peer.id) || !self.balancer.breaker().allow(&peer.id) {
                continue;
            }
            if let RateDecision::Deferred(until) =
                self.limiter.allow(SyncKind::BlockSync, &peer.id).await
            {
                debug!("peer {} rate limited until {}", peer.id, until);
                continue;
            }
            eligible.push(peer);
            if eligible.len() >= self.settings.parallel_downloads {
                break;
            }
        }

        let requests = eligible.into_iter().map(|peer| {
            let client = Arc::clone(&self.client);
            let timeout = adaptive_timeout(
                self.settings.base_timeout_ms,
                peer.reliability,
                self.settings.adaptive_timeouts,
            );
            async move {
                let result = client
                    .get_blocks_range(&peer.url, start, end, timeout)
                    .await;
                (peer, result)
            }
        });

        let mut per_height: HashMap<BlockHeight, Vec<BlockPayload>> = HashMap::new();
        let mut range_supported = false;
        let mut any_success = false;
        for (peer, result) in join_all(requests).await {
            match result {
                Ok(Some(response)) => {
                    range_supported = true;
                    any_success = true;
                    self.registry.record_success(&peer.id);
                    self.balancer.breaker().record_success(&peer.id);
                    for payload in response.blocks {
                        if payload.index >= start && payload.index <= end {
                            per_height.entry(payload.index).or_default().push(payload);
                        }
                    }
                }
                Ok(None) => {
                    // endpoint absent; not a peer failure
                    any_success = true;
                    self.registry.record_success(&peer.id);
                }
                Err(error) => {
                    warn!("range request to {} failed: {}", peer.id, error);
                    self.registry.record_failure(&peer.id);
                    self.balancer.breaker().record_failure(&peer.id);
                }
            }
        }

        if !range_supported {
            if !any_success && self.registry.active_peers().is_empty() {
                return Err(P2pError::NoPeerAvailable("block download".to_string()).into());
            }
            return self.download_per_block(start, end).await;
        }

        let mut resolved: Vec<BlockPayload> = per_height
            .into_values()
            .filter_map(pick_by_plurality)
            .collect();
        resolved.sort_by_key(|payload| payload.index);
        Ok(resolved)
    }

    // Per-block fallback against one peer at a time with failover.
    async fn download_per_block(
        &self,
        start: BlockHeight,
        end: BlockHeight,
    ) -> Result<Vec<BlockPayload>, BlockchainError> {
        let mut payloads = Vec::new();
        for height in start..=end {
            let client = Arc::clone(&self.client);
            let base_timeout = self.settings.base_timeout_ms;
            let adaptive = self.settings.adaptive_timeouts;
            let result = self
                .balancer
                .execute_with_failover("get_block", move |peer| {
                    let client = Arc::clone(&client);
                    async move {
                        let timeout = adaptive_timeout(base_timeout, peer.reliability, adaptive);
                        client.get_block(&peer.url, height, timeout).await
                    }
                })
                .await;
            match result {
                Ok((payload, _)) => payloads.push(payload),
                Err(error) => {
                    warn!("per-block download stopped at {}: {}", height, error);
                    break;
                }
            }
        }
        Ok(payloads)
    }

    // Fast sync: adopt the newest advertised snapshot at a multiple of
    // state_snapshot_size, then download the remainder.
    async fn fast_sync(
        &self,
        local: BlockHeight,
        network: BlockHeight,
        deadline: Instant,
    ) -> Result<u64, BlockchainError> {
        let snapshot_size = self.settings.state_snapshot_size.max(1);
        let mut candidate = (network / snapshot_size) * snapshot_size;

        while candidate > local {
            let advertisers = self.find_snapshot_advertisers(candidate).await;
            if advertisers.is_empty() {
                candidate = candidate.saturating_sub(snapshot_size);
                continue;
            }

            info!(
                "fast sync: snapshot at {} advertised by {} peers",
                candidate,
                advertisers.len()
            );
            let snapshot = self.fetch_snapshot(candidate, &advertisers).await?;

            // the downloaded state must recompute to its advertised root
            let recomputed = compute_snapshot_state_root(&snapshot.state)?;
            if recomputed != snapshot.metadata.state_root
                || snapshot.metadata.height != candidate
            {
                return Err(BlockchainError::SnapshotVerification(format!(
                    "snapshot at {} failed verification",
                    candidate
                )));
            }
            self.snapshots.verify(&snapshot)?;
            self.chain.load_snapshot(&snapshot).await?;

            let applied = self
                .download_and_apply(candidate + 1, network, deadline)
                .await?;
            return Ok(applied);
        }

        debug!("no usable snapshot found, downloading the whole gap");
        self.download_and_apply(local + 1, network, deadline).await
    }

    async fn find_snapshot_advertisers(&self, height: BlockHeight) -> Vec<String> {
        let peers = self.registry.active_peers();
        let probes = peers.into_iter().map(|peer| {
            let client = Arc::clone(&self.client);
            let timeout = adaptive_timeout(
                self.settings.base_timeout_ms,
                peer.reliability,
                self.settings.adaptive_timeouts,
            );
            async move {
                let exists = client
                    .has_state_snapshot(&peer.url, height, timeout)
                    .await
                    .unwrap_or(false);
                exists.then_some(peer)
            }
        });
        join_all(probes)
            .await
            .into_iter()
            .flatten()
            .map(|peer| peer.url)
            .collect()
    }

    async fn fetch_snapshot(
        &self,
        height: BlockHeight,
        advertisers: &[String],
    ) -> Result<stratos_common::api::SnapshotDocument, BlockchainError> {
        let mut last_error: Option<P2pError> = None;
        for url in advertisers {
            let timeout = std::time::Duration::from_millis(
                crate::config::ADAPTIVE_TIMEOUT_MAX_MS * 6,
            );
            match self.client.get_state_snapshot(url, height, timeout).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(error) => {
                    warn!("snapshot download from {} failed: {}", url, error);
                    last_error = Some(error);
                }
            }
        }
        Err(last_error
            .map(BlockchainError::from)
            .unwrap_or_else(|| P2pError::NoPeerAvailable("snapshot".to_string()).into()))
    }

    /// Header-only verification sync for light clients. Headers are
    /// verified (hash recomputation + continuity) but never applied.
    pub async fn light_sync(
        &self,
        start: BlockHeight,
        end: BlockHeight,
    ) -> Result<Vec<BlockHeader>, BlockchainError> {
        let mut headers: Vec<BlockHeader> = Vec::new();
        let mut cursor = start;
        while cursor <= end {
            let batch_end = (cursor + self.settings.batch_block_size - 1).min(end);
            let client = Arc::clone(&self.client);
            let base_timeout = self.settings.base_timeout_ms;
            let adaptive = self.settings.adaptive_timeouts;
            let (response, _) = self
                .balancer
                .execute_with_failover("get_block_headers", move |peer| {
                    let client = Arc::clone(&client);
                    async move {
                        let timeout = adaptive_timeout(base_timeout, peer.reliability, adaptive);
                        client
                            .get_block_headers(&peer.url, cursor, batch_end, timeout)
                            .await
                    }
                })
                .await?;
            if response.headers.is_empty() {
                break;
            }
            headers.extend(response.headers);
            cursor = batch_end + 1;
        }

        verify_header_chain(&headers)
            .map_err(|error| BlockchainError::HeaderChain(error.to_string()))?;
        Ok(headers)
    }

    // Checkpoint sync: trust the best checkpoint at or below the target and
    // bulk-download from there.
    async fn checkpoint_sync(
        &self,
        network: BlockHeight,
        deadline: Instant,
    ) -> Result<u64, BlockchainError> {
        let Some(checkpoint) = self
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.height <= network)
            .max_by_key(|checkpoint| checkpoint.height)
        else {
            // no usable checkpoint below the target; download everything
            let local = self.chain.height().await.unwrap_or(0);
            return self.download_and_apply(local + 1, network, deadline).await;
        };

        info!("bootstrapping from checkpoint at height {}", checkpoint.height);
        self.chain.adopt_checkpoint(checkpoint).await?;
        self.download_and_apply(checkpoint.height + 1, network, deadline)
            .await
    }

    /// SPV helper: prove a transaction's inclusion under a verified header.
    pub fn verify_transaction_inclusion(
        tx_hash: &Hash,
        proof: &[stratos_common::block::ProofNode],
        header: &BlockHeader,
    ) -> bool {
        header.verify_hash().is_ok()
            && stratos_common::block::MerkleTree::verify(tx_hash, proof, &header.merkle_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn idle_engine() -> SyncEngine<crate::core::storage::SledStorage> {
        use crate::core::{consensus::ProofOfStake, storage::SledStorage};
        use crate::p2p::{
            circuit_breaker::CircuitBreaker,
            load_balancer::{LoadBalancer, SelectionStrategy},
            rate_limiter::{RateBudgets, RateLimiter},
        };

        let storage = Arc::new(RwLock::new(SledStorage::temporary().unwrap()));
        let chain = Arc::new(
            crate::core::blockchain::Blockchain::new(
                Arc::clone(&storage),
                Arc::new(ProofOfStake),
                Arc::new(stratos_common::contract::NoopRuntime),
                1000,
            )
            .await
            .unwrap(),
        );
        let registry = Arc::new(PeerRegistry::new());
        let breaker = Arc::new(CircuitBreaker::new(5, 30));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&breaker),
            3,
            SelectionStrategy::HealthBased,
        ));
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&storage),
            RateBudgets::default(),
        ));
        let dir = tempdir::TempDir::new("sync-test").unwrap();
        let snapshots = Arc::new(
            crate::core::snapshot::SnapshotManager::new(
                dir.into_path(),
                false,
                None,
                10,
                true,
            )
            .unwrap(),
        );
        SyncEngine::new(
            chain,
            registry,
            Arc::new(PeerClient::new("node-test".to_string(), false)),
            balancer,
            limiter,
            snapshots,
            Vec::new(),
            SyncSettings {
                batch_block_size: 100,
                parallel_downloads: 10,
                state_snapshot_size: 50_000,
                fast_sync_threshold: 1_000,
                max_sync_time_secs: 3_600,
                base_timeout_ms: 5_000,
                adaptive_timeouts: true,
            },
        )
    }

    #[tokio::test]
    async fn test_sync_at_network_height_is_a_no_op() {
        let engine = idle_engine().await;
        // empty chain, network also at 0: nothing to do, success
        let report = engine.sync_to(0).await.unwrap();
        assert_eq!(report.applied, 0);
        assert!(report.strategy.is_none());
        assert_eq!(engine.phase().await, SyncPhase::Idle);
    }

    #[test]
    fn test_strategy_table() {
        // empty chain with checkpoints bootstraps from one
        assert_eq!(
            choose_strategy(0, 10, true, 1000),
            SyncStrategy::Checkpoint
        );
        // small gaps are always full syncs
        assert_eq!(choose_strategy(0, 99, false, 1000), SyncStrategy::Full);
        assert_eq!(choose_strategy(500, 599, false, 1000), SyncStrategy::Full);
        // medium gaps go fast
        assert_eq!(choose_strategy(0, 100, false, 1000), SyncStrategy::Fast);
        assert_eq!(choose_strategy(100, 999, false, 1000), SyncStrategy::Fast);
        // huge gaps prefer a checkpoint when one exists
        assert_eq!(
            choose_strategy(100, 90_000, true, 1000),
            SyncStrategy::Checkpoint
        );
        assert_eq!(
            choose_strategy(100, 90_000, false, 1000),
            SyncStrategy::Fast
        );
    }

    fn payload(index: u64, marker: &str) -> BlockPayload {
        serde_json::from_value(json!({
            "index": index,
            "timestamp": 1_700_000_000_000u64 + index,
            "previous_hash": marker,
        }))
        .unwrap()
    }

    #[test]
    fn test_plurality_pick() {
        let candidates = vec![
            payload(42, "x"),
            payload(42, "x"),
            payload(42, "x"),
            payload(42, "y"),
            payload(42, "y"),
        ];
        let winner = pick_by_plurality(candidates).unwrap();
        assert_eq!(winner.previous_hash, "x");
        assert!(pick_by_plurality(Vec::new()).is_none());
    }

    #[test]
    fn test_contiguity_truncation() {
        use std::collections::BTreeMap;
        use stratos_common::block::BlockBuilder;

        let first = BlockBuilder::new(1, Vec::new(), "g".to_string(), Vec::new(), BTreeMap::new())
            .with_timestamp(10)
            .build()
            .unwrap();
        let second = BlockBuilder::new(
            2,
            Vec::new(),
            first.hash().to_hex(),
            Vec::new(),
            BTreeMap::new(),
        )
        .with_timestamp(11)
        .build()
        .unwrap();
        let stranger =
            BlockBuilder::new(3, Vec::new(), "unrelated".to_string(), Vec::new(), BTreeMap::new())
                .with_timestamp(12)
                .build()
                .unwrap();
        let fourth = BlockBuilder::new(
            4,
            Vec::new(),
            stranger.hash().to_hex(),
            Vec::new(),
            BTreeMap::new(),
        )
        .with_timestamp(13)
        .build()
        .unwrap();

        let contiguous = truncate_contiguous(vec![first, second, stranger, fourth]);
        assert_eq!(contiguous.len(), 2);
        assert_eq!(contiguous.last().unwrap().height(), 2);
    }

    #[test]
    fn test_spv_inclusion() {
        use std::collections::BTreeMap;
        use stratos_common::{block::BlockBuilder, crypto::KeyPair, transaction::Transaction};

        let keypair = KeyPair::generate();
        let txs: Vec<Transaction> = (0..4)
            .map(|nonce| {
                Transaction::create(
                    &keypair,
                    "rcpt".to_string(),
                    1,
                    1,
                    nonce,
                    21_000,
                    1,
                    None,
                    1_700_000_000_000,
                )
                .unwrap()
            })
            .collect();
        let block = BlockBuilder::new(
            1,
            txs.clone(),
            "g".to_string(),
            Vec::new(),
            BTreeMap::new(),
        )
        .build()
        .unwrap();

        let leaves: Vec<Hash> = txs.iter().map(|tx| tx.hash().clone()).collect();
        let tree = stratos_common::block::MerkleTree::new(leaves);
        let proof = tree.proof(2).unwrap();

        assert!(SyncEngine::<crate::core::storage::SledStorage>::verify_transaction_inclusion(
            txs[2].hash(),
            &proof,
            block.header(),
        ));
        // a proof for one leaf never vouches for another
        assert!(!SyncEngine::<crate::core::storage::SledStorage>::verify_transaction_inclusion(
            txs[3].hash(),
            &proof,
            block.header(),
        ));
    }
}
