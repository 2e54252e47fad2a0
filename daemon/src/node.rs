// Application root
//
// Builds every component with explicit dependency passing (no ambient
// state): storage, chain, peer registry, limiter, breaker, balancer, event
// pipeline, sync engine, snapshots, recovery, and the inter-node API. Also
// owns the periodic task loops and graceful shutdown.

use anyhow::Context;
use log::{debug, error, info, warn};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{sync::{watch, Mutex, RwLock}, task::JoinHandle, time::interval};

use stratos_common::{
    api::{BlockPayload, EventPriority, EventType},
    contract::{ContractRuntime, NoopRuntime},
};

use crate::{
    config::{MEMPOOL_OLD_TX_SECS, NodeConfig},
    core::{
        blockchain::{Blockchain, ChainEvent},
        consensus::{Consensus, ProofOfStake},
        recovery::{AutoRecovery, RecoveryMetrics},
        snapshot::SnapshotManager,
        storage::{SledStorage, Storage},
    },
    p2p::{
        chain_sync::{SyncEngine, SyncSettings},
        circuit_breaker::CircuitBreaker,
        client::PeerClient,
        event::{BatchEventProcessor, EventSync, EventSyncConfig, ProcessorConfig},
        load_balancer::{LoadBalancer, SelectionStrategy},
        peer_list::{PeerRecord, PeerRegistry},
        rate_limiter::{RateBudgets, RateLimiter, SyncKind, SyncRequest},
    },
    rpc::{ApiContext, RpcServer, SharedRpcServer},
};

const PEER_CACHE_FILE: &str = "peers.json";
const DISPATCH_IDLE_MS: u64 = 250;
const QUEUE_DRAIN_SECS: u64 = 5;
const CLEANUP_INTERVAL_SECS: u64 = 3_600;

pub struct Node<S: Storage> {
    pub config: Arc<NodeConfig>,
    pub storage: Arc<RwLock<S>>,
    pub chain: Arc<Blockchain<S>>,
    pub registry: Arc<PeerRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub balancer: Arc<LoadBalancer>,
    pub limiter: Arc<RateLimiter<S>>,
    pub processor: Arc<BatchEventProcessor<S>>,
    pub engine: Arc<SyncEngine<S>>,
    pub event_sync: Arc<EventSync<S>>,
    pub recovery: Arc<AutoRecovery<S>>,
    pub snapshots: Arc<SnapshotManager>,
    rpc: Mutex<Option<SharedRpcServer>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node<SledStorage> {
    /// Build a node over sled storage with the default PoS consensus and
    /// no VM attached.
    pub async fn bootstrap(config: NodeConfig) -> anyhow::Result<Self> {
        let storage = SledStorage::open(&config.data_dir)
            .with_context(|| format!("opening chain database in {:?}", config.data_dir))?;
        Self::assemble(
            config,
            storage,
            Arc::new(ProofOfStake),
            Arc::new(NoopRuntime),
        )
        .await
    }
}

impl<S: Storage> Node<S> {
    pub async fn assemble(
        config: NodeConfig,
        storage: S,
        consensus: Arc<dyn Consensus>,
        runtime: Arc<dyn ContractRuntime>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let node_id = config.effective_node_id();
        let storage = Arc::new(RwLock::new(storage));

        let chain = Arc::new(
            Blockchain::new(
                Arc::clone(&storage),
                consensus,
                runtime,
                config.mempool_max,
            )
            .await?,
        );

        let registry = Arc::new(PeerRegistry::new());
        let peer_cache = config.data_dir.join(PEER_CACHE_FILE);
        match registry.load_from_disk(&peer_cache) {
            Ok(count) => info!("loaded {} cached peers", count),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!("peer cache unreadable: {}", error),
        }
        for (index, url) in config.peers.iter().enumerate() {
            registry.add_peer(PeerRecord::new(format!("seed-{}", index), url.clone()));
        }

        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_timeout,
        ));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&breaker),
            crate::config::DEFAULT_FAILOVER_ATTEMPTS,
            SelectionStrategy::HealthBased,
        ));
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&storage),
            RateBudgets {
                block_sync: config.block_sync_rpm,
                tx_sync: config.tx_sync_rpm,
                mempool_sync: config.mempool_sync_rpm,
                wallet_sync: config.wallet_sync_rpm,
                full_sync: config.full_sync_rpm,
            },
        ));

        let processor = Arc::new(BatchEventProcessor::new(
            Arc::clone(&storage),
            ProcessorConfig {
                batch_size: config.batch_size,
                max_queue_size: config.max_queue_size,
                flush_interval_ms: config.flush_interval_ms,
                max_retries: config.max_retry_attempts,
                deduplicate: config.event_deduplication,
            },
        ));

        let snapshot_key = match &config.snapshot_key {
            Some(hex_key) => {
                let raw = hex::decode(hex_key).context("snapshot key must be hex")?;
                let key: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("snapshot key must be 32 bytes"))?;
                Some(key)
            }
            None => None,
        };
        let snapshots = Arc::new(SnapshotManager::new(
            config.data_dir.join("snapshots"),
            config.enable_compression,
            snapshot_key,
            config.snapshot_retention,
            false,
        )?);

        let client = Arc::new(PeerClient::new(node_id.clone(), config.enable_compression));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&chain),
            Arc::clone(&registry),
            Arc::clone(&client),
            Arc::clone(&balancer),
            Arc::clone(&limiter),
            Arc::clone(&snapshots),
            config.checkpoints.clone(),
            SyncSettings {
                batch_block_size: config.batch_block_size,
                parallel_downloads: config.parallel_downloads,
                state_snapshot_size: config.state_snapshot_size,
                fast_sync_threshold: config.fast_sync_threshold,
                max_sync_time_secs: config.max_sync_time,
                base_timeout_ms: config.propagation_timeout * 1000,
                adaptive_timeouts: config.adaptive_timeouts,
            },
        ));

        let event_sync = Arc::new(EventSync::new(
            EventSyncConfig {
                node_id: node_id.clone(),
                dead_node_threshold_secs: config.dead_node_threshold,
                max_cascade_levels: config.max_cascade_levels,
                cascade_delay_ms: config.sync_cascade_delay_ms,
                max_concurrent_connections: config.parallel_downloads,
                base_timeout_ms: config.propagation_timeout * 1000,
                adaptive_timeouts: config.adaptive_timeouts,
            },
            Arc::clone(&chain),
            Arc::clone(&registry),
            Arc::clone(&client),
            Arc::clone(&processor),
            Arc::clone(&engine),
            Arc::clone(&limiter),
            Arc::clone(&breaker),
        ));

        let recovery = Arc::new(AutoRecovery::new(
            node_id,
            config.mempool_max,
            Arc::clone(&limiter),
            Arc::clone(&storage),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Node {
            config,
            storage,
            chain,
            registry,
            breaker,
            balancer,
            limiter,
            processor,
            engine,
            event_sync,
            recovery,
            snapshots,
            rpc: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the API server and every periodic loop.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        let rpc = RpcServer::start(
            &self.config.bind_address,
            ApiContext {
                chain: Arc::clone(&self.chain),
                event_sync: Arc::clone(&self.event_sync),
                snapshots: Arc::clone(&self.snapshots),
                max_range: self.config.batch_block_size,
            },
        )
        .await?;
        *self.rpc.lock().await = Some(rpc);

        let mut tasks = self.tasks.lock().await;
        tasks.push(Self::spawn_chain_event_forwarder(Arc::clone(&self)));
        tasks.push(Self::spawn_flush_loop(Arc::clone(&self)));
        tasks.push(Self::spawn_dispatch_loop(Arc::clone(&self)));
        tasks.push(Self::spawn_heartbeat_loop(Arc::clone(&self)));
        tasks.push(Self::spawn_queue_drain_loop(Arc::clone(&self)));
        tasks.push(Self::spawn_recovery_loop(Arc::clone(&self)));
        tasks.push(Self::spawn_cleanup_loop(Arc::clone(&self)));
        info!("node started as {}", self.config.effective_node_id());
        Ok(())
    }

    fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    // Forward chain notifications into the propagation pipeline.
    fn spawn_chain_event_forwarder(node: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = node.subscribe_shutdown();
        tokio::spawn(async move {
            let mut events = node.chain.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(ChainEvent::BlockAdded(block)) => {
                            // snapshot cadence: derived state sits exactly at
                            // this block boundary right now
                            let height = block.height();
                            if node.config.state_snapshot_size > 0
                                && height > 0
                                && height % node.config.state_snapshot_size == 0
                            {
                                let state = node.chain.export_state().await;
                                if let Err(error) = node.snapshots.create(
                                    height,
                                    block.hash().to_hex(),
                                    state,
                                ) {
                                    warn!("snapshot at height {} failed: {}", height, error);
                                }
                            }
                            let payload = serde_json::to_value(BlockPayload::from(block.as_ref()))
                                .unwrap_or_else(|_| json!({}));
                            if let Err(error) = node
                                .event_sync
                                .publish(EventType::BlockAdded, payload, EventPriority::Critical)
                                .await
                            {
                                warn!("block.added publish failed: {}", error);
                            }
                        }
                        Ok(ChainEvent::TransactionAdded(tx)) => {
                            let payload =
                                serde_json::to_value(tx.as_ref()).unwrap_or_else(|_| json!({}));
                            if let Err(error) = node
                                .event_sync
                                .publish(
                                    EventType::TransactionBroadcast,
                                    payload,
                                    EventPriority::High,
                                )
                                .await
                            {
                                warn!("transaction.broadcast publish failed: {}", error);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("chain event stream lagged, {} events skipped", skipped);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_flush_loop(node: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = node.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker =
                interval(Duration::from_millis(node.processor.flush_interval_ms()));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                    _ = node.processor.flush_requested() => {}
                }
                if let Err(error) = node.processor.flush().await {
                    error!("event flush failed: {}", error);
                }
            }
        })
    }

    fn spawn_dispatch_loop(node: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = node.subscribe_shutdown();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match node.event_sync.dispatch_pending().await {
                    Ok(0) => {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(Duration::from_millis(DISPATCH_IDLE_MS)) => {}
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        error!("event dispatch failed: {}", error);
                        tokio::time::sleep(Duration::from_millis(DISPATCH_IDLE_MS)).await;
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_loop(node: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = node.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker =
                interval(Duration::from_secs(node.config.heartbeat_interval.max(1)));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(error) = node.event_sync.heartbeat_tick().await {
                    warn!("heartbeat round failed: {}", error);
                }
            }
        })
    }

    // Drain the deferred sync queue left behind by rate limiting and
    // recovery escalations.
    fn spawn_queue_drain_loop(node: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = node.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(QUEUE_DRAIN_SECS));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                loop {
                    let request = match node.limiter.dequeue_next().await {
                        Ok(Some(request)) => request,
                        Ok(None) => break,
                        Err(error) => {
                            error!("deferred queue claim failed: {}", error);
                            break;
                        }
                    };
                    node.handle_deferred(request).await;
                }
            }
        })
    }

    async fn handle_deferred(&self, request: SyncRequest) {
        debug!("running deferred {} request {}", request.kind, request.id);
        let outcome = match request.kind {
            SyncKind::BlockSync | SyncKind::FullSync => {
                let target = request
                    .payload
                    .get("target")
                    .or_else(|| request.payload.get("to"))
                    .and_then(|value| value.as_u64())
                    .unwrap_or_else(|| self.event_sync.observed_network_height());
                self.engine.sync_to(target).await.map(|_| ())
            }
            SyncKind::TxSync | SyncKind::MempoolSync => {
                // offer our pending set; peers answer with mempool.update
                let pending = self.chain.pending_transactions(self.config.batch_size).await;
                self.event_sync
                    .publish(
                        EventType::MempoolUpdate,
                        json!({ "transactions": pending }),
                        EventPriority::Normal,
                    )
                    .await
                    .map(|_| ())
            }
            SyncKind::WalletSync => {
                // wallet state lives outside the node; nothing to drive here
                debug!("wallet sync request {} acknowledged", request.id);
                Ok(())
            }
        };

        let result = match outcome {
            Ok(()) => self.limiter.complete(request).await,
            Err(error) => {
                warn!("deferred request failed: {}", error);
                self.limiter.fail(request).await
            }
        };
        if let Err(error) = result {
            error!("deferred queue bookkeeping failed: {}", error);
        }
    }

    fn spawn_recovery_loop(node: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = node.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(node.config.recovery_interval.max(1)));
            // the first tick fires immediately; skip it so metrics settle
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                let metrics = node.gather_metrics().await;
                match node.recovery.run_check(metrics, &node.chain).await {
                    Ok(triggered) if !triggered.is_empty() => {
                        info!("auto recovery escalated: {:?}", triggered);
                    }
                    Ok(_) => {}
                    Err(error) => error!("auto recovery pass failed: {}", error),
                }
            }
        })
    }

    async fn gather_metrics(&self) -> RecoveryMetrics {
        let cutoff = stratos_common::time::get_current_time_in_millis()
            .saturating_sub(MEMPOOL_OLD_TX_SECS * 1000);
        RecoveryMetrics {
            local_height: self.chain.height().await.unwrap_or(0),
            network_height: self.event_sync.observed_network_height(),
            local_tx_count: self.chain.mempool_len().await as u64,
            network_tx_count: self.event_sync.observed_network_tx_count(),
            mempool_size: self.chain.mempool_len().await,
            old_tx_count: self.chain.mempool_old_tx_count(cutoff).await,
            connectivity_ratio: self.registry.connectivity_ratio(),
            pending_events: self.processor.pending_count().await.unwrap_or(0),
            failed_events: self.processor.failed_count().await.unwrap_or(0),
        }
    }

    fn spawn_cleanup_loop(node: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = node.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                match node.processor.cleanup().await {
                    Ok(purged) if purged > 0 => debug!("cleanup purged {} records", purged),
                    Ok(_) => {}
                    Err(error) => warn!("cleanup pass failed: {}", error),
                }
                let peer_cache = node.config.data_dir.join(PEER_CACHE_FILE);
                if let Err(error) = node.registry.save_to_disk(&peer_cache) {
                    warn!("peer cache save failed: {}", error);
                }
            }
        })
    }

    /// Stop loops, flush the pipeline, persist peers and close storage.
    pub async fn stop(&self) {
        info!("shutting down");
        let _ = self.shutdown.send(true);
        if let Some(rpc) = self.rpc.lock().await.take() {
            rpc.stop(true).await;
        }
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }

        if let Err(error) = self.processor.shutdown().await {
            error!("final event flush failed: {}", error);
        }
        let peer_cache = self.config.data_dir.join(PEER_CACHE_FILE);
        if let Err(error) = self.registry.save_to_disk(&peer_cache) {
            warn!("peer cache save failed: {}", error);
        }
        if let Err(error) = self.storage.read().await.flush() {
            error!("storage flush failed: {}", error);
        }
        info!("shutdown complete");
    }
}
