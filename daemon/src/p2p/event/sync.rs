// Real-time event propagation
//
// Every chain-level occurrence travels as an EventEnvelope through the
// batch processor. The dispatcher drains persisted batches: events this
// node originated fan out to peers (cascading for critical priorities),
// inbound events apply locally and critical ones are relayed onward with
// the source excluded. Gap handling, fork detection and reorganization all
// hang off the block.received path.

use futures::future::join_all;
use log::{debug, info, trace, warn};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::Mutex;

use stratos_common::{
    api::{BlockPayload, EventEnvelope, EventPriority, EventType, HeartbeatPayload},
    block::BlockHeight,
    time::get_current_time_in_seconds,
    transaction::Transaction,
};

use crate::{
    config::{
        CASCADE_HIGH_RELIABILITY, CASCADE_LEVEL0_COUNT, CASCADE_LEVEL1_COUNT,
        CASCADE_MEDIUM_RELIABILITY, FORK_QUORUM_RATIO, FORK_RETRY_COOLDOWN_SECS,
        GAP_BATCH_LIMIT, GAP_IMMEDIATE_LIMIT, HEARTBEAT_FANOUT,
    },
    core::{blockchain::Blockchain, error::BlockchainError, storage::Storage},
    p2p::{
        adaptive_timeout,
        chain_sync::SyncEngine,
        circuit_breaker::CircuitBreaker,
        client::PeerClient,
        event::processor::{BatchEventProcessor, SubmitOutcome},
        peer_list::{PeerRegistry, PeerSnapshot},
        rate_limiter::{RateLimiter, SyncKind},
    },
};

/// What the gap handler decides for an incoming block height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapAction {
    /// Height at or below ours: nothing to do.
    UpToDate,
    /// The direct successor: apply in place.
    Apply,
    /// Small gap: immediate catch-up in this handler.
    Immediate,
    /// Medium gap: deferred batch sync.
    Batch,
    /// Large gap: schedule a full/fast sync.
    Schedule,
}

/// Pure banding of the height gap, so the thresholds are testable.
pub fn gap_action(local: BlockHeight, incoming: BlockHeight) -> GapAction {
    if incoming <= local {
        return GapAction::UpToDate;
    }
    let delta = incoming - local;
    if delta == 1 {
        GapAction::Apply
    } else if delta <= GAP_IMMEDIATE_LIMIT {
        GapAction::Immediate
    } else if delta <= GAP_BATCH_LIMIT {
        GapAction::Batch
    } else {
        GapAction::Schedule
    }
}

/// Peers needed for a fork majority: ⌈0.51 · active⌉.
pub fn fork_quorum(active: usize) -> usize {
    (active as f64 * FORK_QUORUM_RATIO).ceil() as usize
}

/// Partition fan-out targets into cascade levels: the top high-reliability
/// peers first, then the next medium band, then everyone else.
pub fn partition_cascade(peers: Vec<PeerSnapshot>) -> Vec<Vec<PeerSnapshot>> {
    let mut sorted = peers;
    sorted.sort_by(|a, b| {
        b.reliability
            .partial_cmp(&a.reliability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut level0 = Vec::new();
    let mut level1 = Vec::new();
    let mut level2 = Vec::new();
    for peer in sorted {
        if peer.reliability >= CASCADE_HIGH_RELIABILITY && level0.len() < CASCADE_LEVEL0_COUNT {
            level0.push(peer);
        } else if peer.reliability >= CASCADE_MEDIUM_RELIABILITY
            && level1.len() < CASCADE_LEVEL1_COUNT
        {
            level1.push(peer);
        } else {
            level2.push(peer);
        }
    }
    [level0, level1, level2]
        .into_iter()
        .filter(|level| !level.is_empty())
        .collect()
}

pub struct EventSyncConfig {
    pub node_id: String,
    pub dead_node_threshold_secs: u64,
    pub max_cascade_levels: usize,
    pub cascade_delay_ms: u64,
    pub max_concurrent_connections: usize,
    pub base_timeout_ms: u64,
    pub adaptive_timeouts: bool,
}

pub struct EventSync<S: Storage> {
    config: EventSyncConfig,
    chain: Arc<Blockchain<S>>,
    registry: Arc<PeerRegistry>,
    client: Arc<PeerClient>,
    processor: Arc<BatchEventProcessor<S>>,
    engine: Arc<SyncEngine<S>>,
    limiter: Arc<RateLimiter<S>>,
    breaker: Arc<CircuitBreaker>,
    started_at: Instant,
    // network view assembled from heartbeats and received blocks
    network_height: AtomicU64,
    network_tx_count: AtomicU64,
    // fork heights we recently failed to resolve, with the attempt time
    fork_cooldowns: Mutex<HashMap<BlockHeight, u64>>,
}

impl<S: Storage> EventSync<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EventSyncConfig,
        chain: Arc<Blockchain<S>>,
        registry: Arc<PeerRegistry>,
        client: Arc<PeerClient>,
        processor: Arc<BatchEventProcessor<S>>,
        engine: Arc<SyncEngine<S>>,
        limiter: Arc<RateLimiter<S>>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        EventSync {
            config,
            chain,
            registry,
            client,
            processor,
            engine,
            limiter,
            breaker,
            started_at: Instant::now(),
            network_height: AtomicU64::new(0),
            network_tx_count: AtomicU64::new(0),
            fork_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Best known network height, from heartbeats and received blocks.
    pub fn observed_network_height(&self) -> BlockHeight {
        self.network_height.load(Ordering::Relaxed)
    }

    pub fn observed_network_tx_count(&self) -> u64 {
        self.network_tx_count.load(Ordering::Relaxed)
    }

    fn observe_height(&self, height: BlockHeight) {
        self.network_height.fetch_max(height, Ordering::Relaxed);
    }

    /// Publish a locally originated event into the pipeline. The dispatcher
    /// will fan it out to peers.
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        priority: EventPriority,
    ) -> Result<EventEnvelope, BlockchainError> {
        let envelope = EventEnvelope::new(event_type, payload, priority, &self.config.node_id)?;
        self.processor.submit(envelope.clone()).await?;
        Ok(envelope)
    }

    /// Accept an envelope arriving over HTTP. Duplicates are fine: the
    /// caller answers 2xx either way.
    pub async fn ingest(&self, envelope: EventEnvelope) -> Result<SubmitOutcome, BlockchainError> {
        if envelope.source_node != self.config.node_id {
            self.registry.record_success(&envelope.source_node);
        }
        self.processor.submit(envelope).await
    }

    /// Drain one persisted batch through the handlers.
    pub async fn dispatch_pending(&self) -> Result<usize, BlockchainError> {
        let batch = self.processor.claim_batch().await?;
        let count = batch.len();
        for event in batch {
            match self.dispatch(&event).await {
                Ok(()) => self.processor.complete(&event).await?,
                Err(error) if error.is_validation() => {
                    // deterministic junk: never retried
                    warn!("event {} rejected: {}", event.id, error);
                    self.processor.complete(&event).await?;
                }
                Err(error) => {
                    warn!("event {} failed: {}", event.id, error);
                    self.processor.fail(&event).await?;
                }
            }
        }
        Ok(count)
    }

    async fn dispatch(&self, event: &EventEnvelope) -> Result<(), BlockchainError> {
        trace!("dispatching {} ({})", event.id, event.event_type);
        if event.source_node == self.config.node_id {
            self.fan_out(event, None).await;
            return Ok(());
        }

        self.apply_inbound(event).await?;
        // critical news keeps travelling, minus where it came from
        if event.priority == EventPriority::Critical {
            self.fan_out(event, Some(&event.source_node)).await;
        }
        Ok(())
    }

    async fn apply_inbound(&self, event: &EventEnvelope) -> Result<(), BlockchainError> {
        match event.event_type {
            EventType::BlockAdded | EventType::BlockReceived => {
                let payload: BlockPayload = serde_json::from_value(event.payload.clone())?;
                self.handle_incoming_block(payload).await
            }
            EventType::TransactionBroadcast => {
                let tx: Transaction = serde_json::from_value(event.payload.clone())?;
                match self.chain.add_transaction(tx).await {
                    Ok(()) | Err(BlockchainError::DuplicateTransaction(_)) => Ok(()),
                    Err(error) => Err(error),
                }
            }
            EventType::MempoolUpdate => {
                let txs: Vec<Transaction> = serde_json::from_value(
                    event
                        .payload
                        .get("transactions")
                        .cloned()
                        .unwrap_or_else(|| json!([])),
                )?;
                self.network_tx_count
                    .store(txs.len() as u64, Ordering::Relaxed);
                for tx in txs {
                    match self.chain.add_transaction(tx).await {
                        Ok(()) | Err(BlockchainError::DuplicateTransaction(_)) => {}
                        Err(error) => debug!("mempool update entry skipped: {}", error),
                    }
                }
                Ok(())
            }
            EventType::Heartbeat => {
                let heartbeat: HeartbeatPayload =
                    serde_json::from_value(event.payload.clone())?;
                self.observe_height(heartbeat.height);
                self.network_tx_count
                    .fetch_max(heartbeat.mempool_size as u64, Ordering::Relaxed);

                let local = self.chain.height().await.unwrap_or(0);
                match gap_action(local, heartbeat.height) {
                    GapAction::Batch | GapAction::Schedule => {
                        self.schedule_gap_sync(local, heartbeat.height).await?;
                    }
                    _ => {}
                }
                Ok(())
            }
            EventType::ForkDetected => {
                let height = event
                    .payload
                    .get("height")
                    .and_then(|value| value.as_u64())
                    .unwrap_or(0);
                self.resolve_fork(height).await
            }
            EventType::SyncGapDetected => {
                let to = event
                    .payload
                    .get("to")
                    .and_then(|value| value.as_u64())
                    .unwrap_or(0);
                self.observe_height(to);
                self.engine.sync_to(to).await.map(|_| ())
            }
            EventType::ChainReorganize => {
                let fork_height = event
                    .payload
                    .get("fork_height")
                    .and_then(|value| value.as_u64())
                    .unwrap_or(0);
                self.resolve_fork(fork_height).await
            }
        }
    }

    // The block.received path: apply a direct successor, detect forks on a
    // previous-hash mismatch, and band larger gaps into catch-up actions.
    async fn handle_incoming_block(
        &self,
        payload: BlockPayload,
    ) -> Result<(), BlockchainError> {
        self.observe_height(payload.index);
        let local = self.chain.height().await.unwrap_or(0);

        match gap_action(local, payload.index) {
            GapAction::UpToDate => {
                // same height with a different hash is a fork signal
                if payload.index == local {
                    if let Some(tip) = self.chain.tip().await {
                        if payload.fingerprint() != tip.hash_hex {
                            info!("competing block at our tip height {}", local);
                            self.publish(
                                EventType::ForkDetected,
                                json!({ "height": local }),
                                EventPriority::Critical,
                            )
                            .await?;
                        }
                    }
                }
                Ok(())
            }
            GapAction::Apply => {
                let tip = self.chain.tip().await;
                if let Some(tip) = tip {
                    if payload.previous_hash != tip.hash_hex {
                        info!(
                            "previous-hash mismatch at height {}: fork suspected",
                            payload.index
                        );
                        return self.resolve_fork(tip.height).await;
                    }
                }
                match self.chain.add_block(payload.into_block()?).await {
                    Ok(()) => Ok(()),
                    // competing valid block lost the race; nothing broken
                    Err(BlockchainError::NonSequentialBlock { .. }) => Ok(()),
                    Err(error) => Err(error),
                }
            }
            GapAction::Immediate => {
                info!(
                    "gap of {} blocks behind {}, immediate catch-up",
                    payload.index - local,
                    payload.index
                );
                self.engine.sync_to(payload.index).await.map(|_| ())
            }
            GapAction::Batch => {
                info!(
                    "gap of {} blocks, deferring batch sync",
                    payload.index - local
                );
                self.schedule_gap_sync(local, payload.index).await
            }
            GapAction::Schedule => {
                info!(
                    "gap of {} blocks, scheduling full sync",
                    payload.index - local
                );
                self.publish(
                    EventType::SyncGapDetected,
                    json!({ "from": local, "to": payload.index }),
                    EventPriority::High,
                )
                .await?;
                self.limiter
                    .enqueue(
                        SyncKind::FullSync,
                        json!({ "target": payload.index }),
                        None,
                        1,
                        0,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn schedule_gap_sync(
        &self,
        local: BlockHeight,
        target: BlockHeight,
    ) -> Result<(), BlockchainError> {
        self.limiter
            .enqueue(
                SyncKind::BlockSync,
                json!({ "from": local, "to": target }),
                None,
                2,
                0,
            )
            .await?;
        Ok(())
    }

    /// Resolve a disputed height: poll every active peer for its block at
    /// that height, look for a ⌈51%⌉ majority, and reorganize onto the
    /// majority branch if it differs from ours. With no majority the local
    /// chain stands and the height goes on cooldown.
    pub async fn resolve_fork(&self, height: BlockHeight) -> Result<(), BlockchainError> {
        if height == 0 {
            // genesis is immutable
            return Ok(());
        }
        {
            let cooldowns = self.fork_cooldowns.lock().await;
            if let Some(last) = cooldowns.get(&height) {
                if get_current_time_in_seconds().saturating_sub(*last)
                    < FORK_RETRY_COOLDOWN_SECS
                {
                    debug!("fork at {} still cooling down", height);
                    return Ok(());
                }
            }
        }

        let peers = self.registry.active_peers();
        let active = peers.len();
        if active == 0 {
            return Err(crate::p2p::error::P2pError::NoPeerAvailable(
                "fork resolution".to_string(),
            )
            .into());
        }
        let needed = fork_quorum(active);

        // gather the block at the disputed height from everyone
        let probes = peers.into_iter().map(|peer| {
            let client = Arc::clone(&self.client);
            let timeout = adaptive_timeout(
                self.config.base_timeout_ms,
                peer.reliability,
                self.config.adaptive_timeouts,
            );
            async move {
                let result = client.get_block(&peer.url, height, timeout).await;
                (peer, result)
            }
        });

        let mut support: HashMap<String, (usize, BlockPayload, Vec<PeerSnapshot>)> =
            HashMap::new();
        for (peer, result) in join_all(probes).await {
            match result {
                Ok(payload) => {
                    let fingerprint = payload.fingerprint();
                    let entry = support
                        .entry(fingerprint)
                        .or_insert_with(|| (0, payload, Vec::new()));
                    entry.0 += 1;
                    entry.2.push(peer);
                }
                Err(error) => {
                    debug!("fork probe to {} failed: {}", peer.id, error);
                    self.registry.record_failure(&peer.id);
                }
            }
        }

        let Some((canonical_fingerprint, (count, _, supporters))) = support
            .into_iter()
            .max_by_key(|(_, (count, _, _))| *count)
        else {
            return Err(BlockchainError::NoForkMajority { active, needed });
        };

        if count < needed {
            info!(
                "no fork majority at height {}: best {} of {} needed",
                height, count, needed
            );
            self.fork_cooldowns
                .lock()
                .await
                .insert(height, get_current_time_in_seconds());
            return Err(BlockchainError::NoForkMajority { active, needed });
        }

        let local_hash = self
            .chain
            .get_block_by_height(height)
            .await?
            .map(|block| block.hash().to_hex());
        if local_hash.as_deref() == Some(canonical_fingerprint.as_str()) {
            debug!("we already sit on the canonical branch at {}", height);
            return Ok(());
        }

        info!(
            "canonical block at {} is {} ({} supporters), reorganizing",
            height, canonical_fingerprint, count
        );
        self.publish(
            EventType::ChainReorganize,
            json!({ "fork_height": height, "canonical": canonical_fingerprint }),
            EventPriority::Critical,
        )
        .await?;

        // rewind the mutable tip, then reapply the canonical branch from a
        // supporting peer
        let orphaned = self.chain.rewind_to(height).await?;
        let target = self.observed_network_height().max(height);
        let mut reapplied = 0u64;
        'heights: for h in height..=target {
            for peer in &supporters {
                let timeout = adaptive_timeout(
                    self.config.base_timeout_ms,
                    peer.reliability,
                    self.config.adaptive_timeouts,
                );
                match self.client.get_block(&peer.url, h, timeout).await {
                    Ok(payload) => {
                        match self.chain.add_block(payload.into_block()?).await {
                            Ok(()) => {
                                reapplied += 1;
                                continue 'heights;
                            }
                            Err(error) => {
                                warn!("reorg apply failed at {}: {}", h, error);
                                break 'heights;
                            }
                        }
                    }
                    Err(error) => {
                        debug!("reorg fetch from {} failed at {}: {}", peer.id, h, error);
                        continue;
                    }
                }
            }
            break;
        }

        let restored = self.chain.restore_orphaned_transactions(&orphaned).await;
        info!(
            "reorganization at {} done: {} blocks reapplied, {} transactions repooled",
            height, reapplied, restored
        );
        Ok(())
    }

    /// Fan an envelope out to peers. Critical events cascade through
    /// reliability levels with a delay between them; everything else goes
    /// out in one pass of bounded concurrent groups.
    async fn fan_out(&self, envelope: &EventEnvelope, exclude: Option<&str>) {
        let targets: Vec<PeerSnapshot> = self
            .registry
            .active_peers()
            .into_iter()
            .filter(|peer| Some(peer.id.as_str()) != exclude)
            .filter(|peer| !self.registry.is_suppressed(&peer.id))
            .collect();
        if targets.is_empty() {
            return;
        }

        if envelope.priority == EventPriority::Critical {
            let levels = partition_cascade(targets);
            for (index, level) in levels
                .into_iter()
                .take(self.config.max_cascade_levels)
                .enumerate()
            {
                if index > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.cascade_delay_ms,
                    ))
                    .await;
                }
                debug!(
                    "cascade level {}: {} peers for {}",
                    index,
                    level.len(),
                    envelope.id
                );
                self.send_group(envelope, level).await;
            }
        } else {
            self.send_group(envelope, targets).await;
        }
    }

    // Bounded-concurrency delivery: peers are posted to in groups of at
    // most max_concurrent_connections.
    async fn send_group(&self, envelope: &EventEnvelope, peers: Vec<PeerSnapshot>) {
        for group in peers.chunks(self.config.max_concurrent_connections) {
            let posts = group.iter().map(|peer| {
                let client = Arc::clone(&self.client);
                let timeout = adaptive_timeout(
                    self.config.base_timeout_ms,
                    peer.reliability,
                    self.config.adaptive_timeouts,
                );
                async move {
                    if !self.breaker.allow(&peer.id) {
                        return (peer, Err(crate::p2p::error::P2pError::CircuitOpen(
                            peer.id.clone(),
                        )));
                    }
                    let result = client.post_event(&peer.url, envelope, timeout).await;
                    (peer, result)
                }
            });
            for (peer, result) in join_all(posts).await {
                match result {
                    Ok(()) => {
                        self.registry.record_success(&peer.id);
                        self.breaker.record_success(&peer.id);
                    }
                    Err(crate::p2p::error::P2pError::CircuitOpen(_)) => {}
                    Err(error) => {
                        debug!("event delivery to {} failed: {}", peer.id, error);
                        self.registry.record_failure(&peer.id);
                        self.registry.note_send_failure(
                            &peer.id,
                            self.config.base_timeout_ms / 1000,
                        );
                        self.breaker.record_failure(&peer.id);
                    }
                }
            }
        }
    }

    /// One heartbeat round: a LOW event with our vitals to the top
    /// reputation peers, plus the dead-node and failure-memory sweeps.
    pub async fn heartbeat_tick(&self) -> Result<(), BlockchainError> {
        let height = self.chain.height().await.unwrap_or(0);
        let payload = HeartbeatPayload {
            node_id: self.config.node_id.clone(),
            height,
            mempool_size: self.chain.mempool_len().await,
            uptime: self.uptime_secs(),
        };
        let envelope = EventEnvelope::new(
            EventType::Heartbeat,
            serde_json::to_value(&payload).map_err(BlockchainError::from)?,
            EventPriority::Low,
            &self.config.node_id,
        )?;

        let targets: Vec<PeerSnapshot> = self
            .registry
            .active_peers()
            .into_iter()
            .take(HEARTBEAT_FANOUT)
            .collect();
        trace!("heartbeat to {} peers at height {}", targets.len(), height);
        self.send_group(&envelope, targets).await;

        let demoted = self
            .registry
            .prune_dead(self.config.dead_node_threshold_secs);
        if !demoted.is_empty() {
            info!("{} peers demoted as dead", demoted.len());
        }
        self.registry.clear_stale_failures();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_bands() {
        // the documented boundary deltas
        assert_eq!(gap_action(100, 100), GapAction::UpToDate); // Δ=0
        assert_eq!(gap_action(100, 101), GapAction::Apply); // Δ=1
        assert_eq!(gap_action(100, 110), GapAction::Immediate); // Δ=10
        assert_eq!(gap_action(100, 111), GapAction::Batch); // Δ=11
        assert_eq!(gap_action(100, 200), GapAction::Batch); // Δ=100
        assert_eq!(gap_action(100, 201), GapAction::Schedule); // Δ=101
    }

    #[test]
    fn test_fork_quorum_ceiling() {
        assert_eq!(fork_quorum(5), 3); // ⌈2.55⌉
        assert_eq!(fork_quorum(4), 3); // ⌈2.04⌉
        assert_eq!(fork_quorum(2), 2); // ⌈1.02⌉
        assert_eq!(fork_quorum(1), 1);
        assert_eq!(fork_quorum(100), 51);
    }

    fn peer(id: &str, reliability: f64) -> PeerSnapshot {
        PeerSnapshot {
            id: id.to_string(),
            url: format!("http://{}", id),
            reputation: 80,
            last_seen: 0,
            reliability,
            latency_ms: None,
        }
    }

    #[test]
    fn test_cascade_partitioning() {
        let peers = vec![
            peer("h1", 0.99),
            peer("h2", 0.95),
            peer("h3", 0.92),
            peer("h4", 0.91),
            peer("m1", 0.85),
            peer("m2", 0.75),
            peer("l1", 0.5),
        ];
        let levels = partition_cascade(peers);
        assert_eq!(levels.len(), 3);

        // top three high-reliability peers form level 0
        let level0: Vec<&str> = levels[0].iter().map(|peer| peer.id.as_str()).collect();
        assert_eq!(level0, vec!["h1", "h2", "h3"]);
        // the fourth high peer overflows into the medium band
        let level1: Vec<&str> = levels[1].iter().map(|peer| peer.id.as_str()).collect();
        assert_eq!(level1, vec!["h4", "m1", "m2"]);
        let level2: Vec<&str> = levels[2].iter().map(|peer| peer.id.as_str()).collect();
        assert_eq!(level2, vec!["l1"]);
    }

    #[test]
    fn test_cascade_skips_empty_levels() {
        let peers = vec![peer("l1", 0.2), peer("l2", 0.3)];
        let levels = partition_cascade(peers);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 2);
    }
}
