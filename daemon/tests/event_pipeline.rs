// End-to-end pipeline tests over an assembled node (no HTTP server): events
// enter through the same ingest path the API uses, get flushed, claimed and
// dispatched by the same machinery the background loops drive.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::json;
use stratos_common::{
    api::{BlockPayload, EventEnvelope, EventPriority, EventStatus, EventType},
    block::{genesis_block, BlockBuilder},
    crypto::KeyPair,
    time::get_current_time_in_millis,
    transaction::Transaction,
};
use stratos_daemon::{
    config::NodeConfig,
    core::{
        consensus::ProofOfStake,
        storage::{EventQueueProvider, SledStorage},
    },
    node::Node,
    p2p::rate_limiter::SyncKind,
};

async fn assemble_node() -> Arc<Node<SledStorage>> {
    let dir = tempdir::TempDir::new("stratos-test").unwrap();
    let mut config = NodeConfig::default();
    config.data_dir = dir.into_path();
    config.node_id = Some("node-under-test".to_string());

    let node = Node::assemble(
        config,
        SledStorage::temporary().unwrap(),
        Arc::new(ProofOfStake),
        Arc::new(stratos_common::contract::NoopRuntime),
    )
    .await
    .unwrap();
    Arc::new(node)
}

async fn seed_genesis(node: &Node<SledStorage>, funded: &KeyPair, amount: u64) {
    let genesis = genesis_block(
        BTreeMap::from([(funded.address(), amount)]),
        1_700_000_000_000,
    )
    .unwrap();
    node.chain.add_block(genesis).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_event_processes_exactly_once() {
    let node = assemble_node().await;
    let sender = KeyPair::generate();
    seed_genesis(&node, &sender, 100).await;

    let tx = Transaction::create(
        &sender,
        "recipient".to_string(),
        5,
        1,
        0,
        21_000,
        1,
        None,
        get_current_time_in_millis(),
    )
    .unwrap();
    let envelope = EventEnvelope::new(
        EventType::TransactionBroadcast,
        serde_json::to_value(&tx).unwrap(),
        EventPriority::High,
        "peer-a",
    )
    .unwrap();

    // same envelope twice within the dedup TTL
    node.event_sync.ingest(envelope.clone()).await.unwrap();
    node.event_sync.ingest(envelope.clone()).await.unwrap();
    node.processor.flush().await.unwrap();

    let dispatched = node.event_sync.dispatch_pending().await.unwrap();
    assert_eq!(dispatched, 1);
    assert_eq!(node.event_sync.dispatch_pending().await.unwrap(), 0);

    // exactly one mempool entry and one completed queue row
    assert_eq!(node.chain.mempool_len().await, 1);
    let completed = node
        .storage
        .read()
        .await
        .count_events_with_status(EventStatus::Completed)
        .await
        .unwrap();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_inbound_successor_block_applies() {
    let node = assemble_node().await;
    let sender = KeyPair::generate();
    seed_genesis(&node, &sender, 100).await;
    let tip = node.chain.tip().await.unwrap();

    let successor = BlockBuilder::new(
        1,
        Vec::new(),
        tip.hash_hex.clone(),
        Vec::new(),
        BTreeMap::new(),
    )
    .with_timestamp(tip.timestamp + 1)
    .build()
    .unwrap();

    let envelope = EventEnvelope::new(
        EventType::BlockReceived,
        serde_json::to_value(BlockPayload::from(&successor)).unwrap(),
        EventPriority::Critical,
        "peer-a",
    )
    .unwrap();
    node.event_sync.ingest(envelope).await.unwrap();
    node.processor.flush().await.unwrap();
    node.event_sync.dispatch_pending().await.unwrap();

    assert_eq!(node.chain.height().await, Some(1));
    assert!(node.chain.is_chain_valid().await.unwrap());
}

#[tokio::test]
async fn test_large_gap_schedules_full_sync() {
    let node = assemble_node().await;
    let sender = KeyPair::generate();
    seed_genesis(&node, &sender, 100).await;

    // a block far ahead of our tip: Δ > 100
    let distant: BlockPayload = serde_json::from_value(json!({
        "index": 500u64,
        "timestamp": get_current_time_in_millis(),
        "previous_hash": "somewhere-far",
    }))
    .unwrap();
    let envelope = EventEnvelope::new(
        EventType::BlockReceived,
        serde_json::to_value(&distant).unwrap(),
        EventPriority::Critical,
        "peer-a",
    )
    .unwrap();
    node.event_sync.ingest(envelope).await.unwrap();
    node.processor.flush().await.unwrap();
    node.event_sync.dispatch_pending().await.unwrap();

    // chain untouched, but a priority-1 full sync request is waiting
    assert_eq!(node.chain.height().await, Some(0));
    let request = node.limiter.dequeue_next().await.unwrap().unwrap();
    assert_eq!(request.kind, SyncKind::FullSync);
    assert_eq!(request.priority, 1);
}

#[tokio::test]
async fn test_stale_and_invalid_events_complete_without_retry() {
    let node = assemble_node().await;
    let sender = KeyPair::generate();
    seed_genesis(&node, &sender, 100).await;

    // a block we already have (height 0) is old news, not an error
    let genesis = node.chain.get_block_by_height(0).await.unwrap().unwrap();
    let stale = EventEnvelope::new(
        EventType::BlockReceived,
        serde_json::to_value(BlockPayload::from(&genesis)).unwrap(),
        EventPriority::Normal,
        "peer-a",
    )
    .unwrap();
    node.event_sync.ingest(stale).await.unwrap();
    node.processor.flush().await.unwrap();
    node.event_sync.dispatch_pending().await.unwrap();

    let storage = node.storage.read().await;
    assert_eq!(
        storage
            .count_events_with_status(EventStatus::Completed)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        storage
            .count_events_with_status(EventStatus::Pending)
            .await
            .unwrap(),
        0
    );
}
