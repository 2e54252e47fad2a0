// Sled-backed storage
//
// One tree per logical table. Block appends run as a single transaction
// over the block tree, the by-hash index and the counters tree, then flush
// before returning so a crash never leaves an indexed-but-missing block.

use async_trait::async_trait;
use log::{debug, trace, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sled::{transaction::ConflictableTransactionError, Transactional};
use std::{io::Write, num::NonZeroUsize, path::Path, sync::Mutex};

use stratos_common::{
    api::{EventEnvelope, EventStatus},
    block::{Block, BlockHeight},
    time::TimestampMillis,
    transaction::Transaction,
};

use crate::{
    config::{
        DEFAULT_EVENT_SEEN_TTL_SECS, EVENT_COMPLETED_RETENTION_SECS,
        EVENT_FAILED_RETENTION_SECS, SYNC_QUEUE_MAX_RETRIES,
    },
    core::{error::BlockchainError, recovery::RecoveryEntry},
    p2p::rate_limiter::{RateWindow, SyncRequest, SyncRequestStatus},
};

use super::{
    BlockProvider, EventQueueProvider, MempoolProvider, RateLimitProvider, RecoveryLogProvider,
    Storage, SyncQueueProvider,
};

const BLOCKS_COUNT_KEY: &[u8] = b"blocks_count";
const RECOVERY_SEQ_KEY: &[u8] = b"recovery_seq";
// a claim older than this without a terminal status is considered orphaned
const STALE_CLAIM_SECS: u64 = 60 * 60;
// hot blocks kept decoded in memory
const BLOCK_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(size) => size,
    None => unreachable!(),
};

// Stored alongside each queued event so retention can be computed from the
// moment the event reached a terminal status.
#[derive(Serialize, Deserialize)]
struct StoredEvent {
    event: EventEnvelope,
    processed_at: Option<TimestampMillis>,
}

pub struct SledStorage {
    db: sled::Db,
    blocks: sled::Tree,
    block_hashes: sled::Tree,
    mempool: sled::Tree,
    event_queue: sled::Tree,
    seen_events: sled::Tree,
    rate_limits: sled::Tree,
    sync_queue: sled::Tree,
    recovery_log: sled::Tree,
    extra: sled::Tree,
    blocks_cache: Mutex<LruCache<BlockHeight, Block>>,
    // secondary raw block log, best effort only
    binary_log: Option<std::path::PathBuf>,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BlockchainError> {
        let path = path.as_ref();
        let db = sled::open(path.join("chain"))?;
        Ok(SledStorage {
            blocks: db.open_tree("blocks")?,
            block_hashes: db.open_tree("block_hashes")?,
            mempool: db.open_tree("mempool")?,
            event_queue: db.open_tree("event_queue")?,
            seen_events: db.open_tree("seen_events")?,
            rate_limits: db.open_tree("sync_rate_limits")?,
            sync_queue: db.open_tree("sync_queue_priority")?,
            recovery_log: db.open_tree("sync_recovery_log")?,
            extra: db.open_tree("extra")?,
            blocks_cache: Mutex::new(LruCache::new(BLOCK_CACHE_SIZE)),
            binary_log: Some(path.join("blocks.bin")),
            db,
        })
    }

    /// In-memory instance for tests.
    pub fn temporary() -> Result<Self, BlockchainError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(SledStorage {
            blocks: db.open_tree("blocks")?,
            block_hashes: db.open_tree("block_hashes")?,
            mempool: db.open_tree("mempool")?,
            event_queue: db.open_tree("event_queue")?,
            seen_events: db.open_tree("seen_events")?,
            rate_limits: db.open_tree("sync_rate_limits")?,
            sync_queue: db.open_tree("sync_queue_priority")?,
            recovery_log: db.open_tree("sync_recovery_log")?,
            extra: db.open_tree("extra")?,
            blocks_cache: Mutex::new(LruCache::new(BLOCK_CACHE_SIZE)),
            binary_log: None,
            db,
        })
    }

    fn blocks_count(&self) -> Result<u64, BlockchainError> {
        Ok(self
            .extra
            .get(BLOCKS_COUNT_KEY)?
            .map(|raw| be_to_u64(&raw))
            .unwrap_or(0))
    }

    // Append the raw block JSON to the secondary binary log. Failures are
    // logged and swallowed; the primary store is the source of truth.
    fn append_binary_log(&self, raw: &[u8]) {
        let Some(path) = &self.binary_log else {
            return;
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                file.write_all(raw)?;
                file.write_all(b"\n")
            });
        if let Err(error) = result {
            warn!("binary block log append failed: {}", error);
        }
    }
}

fn u64_to_be(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

fn be_to_u64(raw: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let len = raw.len().min(8);
    bytes[8 - len..].copy_from_slice(&raw[raw.len() - len..]);
    u64::from_be_bytes(bytes)
}

#[async_trait]
impl BlockProvider for SledStorage {
    async fn save_block(&mut self, block: &Block) -> Result<(), BlockchainError> {
        let height = block.height();
        let count = self.blocks_count()?;
        debug!("saving block {} at height {}", block.hash(), height);

        let raw = serde_json::to_vec(block)?;
        let hash_hex = block.hash().to_hex();

        (&self.blocks, &self.block_hashes, &self.extra)
            .transaction(|(blocks, hashes, extra)| {
                blocks.insert(&u64_to_be(height), raw.as_slice())?;
                hashes.insert(hash_hex.as_bytes(), &u64_to_be(height)[..])?;
                extra.insert(BLOCKS_COUNT_KEY, &u64_to_be(count.max(height + 1))[..])?;
                Ok::<(), ConflictableTransactionError<sled::Error>>(())
            })
            .map_err(|error| match error {
                sled::transaction::TransactionError::Abort(e) => BlockchainError::Storage(e),
                sled::transaction::TransactionError::Storage(e) => BlockchainError::Storage(e),
            })?;

        // durable before we report success
        self.db.flush_async().await?;
        self.append_binary_log(&raw);
        if let Ok(mut cache) = self.blocks_cache.lock() {
            cache.put(height, block.clone());
        }
        Ok(())
    }

    async fn get_block_by_height(
        &self,
        height: BlockHeight,
    ) -> Result<Option<Block>, BlockchainError> {
        trace!("get block at height {}", height);
        if let Ok(mut cache) = self.blocks_cache.lock() {
            if let Some(block) = cache.get(&height) {
                return Ok(Some(block.clone()));
            }
        }
        match self.blocks.get(u64_to_be(height))? {
            Some(raw) => {
                let block: Block = serde_json::from_slice(&raw)?;
                if let Ok(mut cache) = self.blocks_cache.lock() {
                    cache.put(height, block.clone());
                }
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    async fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, BlockchainError> {
        trace!("get block with hash {}", hash);
        match self.block_hashes.get(hash.as_bytes())? {
            Some(raw) => self.get_block_by_height(be_to_u64(&raw)).await,
            None => Ok(None),
        }
    }

    async fn count_blocks(&self) -> Result<u64, BlockchainError> {
        self.blocks_count()
    }

    async fn truncate_from(
        &mut self,
        height: BlockHeight,
    ) -> Result<Vec<Block>, BlockchainError> {
        let count = self.blocks_count()?;
        // genesis is immutable
        let floor = height.max(1);
        let mut removed = Vec::new();

        let mut current = count;
        while current > floor {
            current -= 1;
            if let Some(raw) = self.blocks.remove(u64_to_be(current))? {
                let block: Block = serde_json::from_slice(&raw)?;
                self.block_hashes.remove(block.hash().to_hex().as_bytes())?;
                if let Ok(mut cache) = self.blocks_cache.lock() {
                    cache.pop(&current);
                }
                removed.push(block);
            }
        }
        self.extra.insert(BLOCKS_COUNT_KEY, &u64_to_be(floor.min(count))[..])?;
        self.db.flush_async().await?;
        debug!("truncated {} blocks from height {}", removed.len(), floor);
        Ok(removed)
    }
}

#[async_trait]
impl EventQueueProvider for SledStorage {
    async fn persist_events(&mut self, events: &[EventEnvelope]) -> Result<(), BlockchainError> {
        let mut batch = sled::Batch::default();
        for event in events {
            if self.event_queue.contains_key(event.id.as_bytes())? {
                continue;
            }
            let stored = StoredEvent {
                event: event.clone(),
                processed_at: None,
            };
            batch.insert(event.id.as_bytes(), serde_json::to_vec(&stored)?);
        }
        self.event_queue.apply_batch(batch)?;
        Ok(())
    }

    async fn claim_pending_events(
        &mut self,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, BlockchainError> {
        let mut pending = Vec::new();
        for entry in self.event_queue.iter() {
            let (key, raw) = entry?;
            let stored: StoredEvent = serde_json::from_slice(&raw)?;
            if stored.event.status == EventStatus::Pending {
                pending.push((key, stored.event));
            }
        }
        // batch order: priority ascending, then arrival time
        pending.sort_by_key(|(_, event)| (event.priority, event.timestamp));
        pending.truncate(limit);

        let mut claimed = Vec::with_capacity(pending.len());
        for (key, mut event) in pending {
            event.status = EventStatus::Processing;
            let stored = StoredEvent {
                event: event.clone(),
                processed_at: None,
            };
            self.event_queue.insert(key, serde_json::to_vec(&stored)?)?;
            claimed.push(event);
        }
        Ok(claimed)
    }

    async fn mark_event(
        &mut self,
        id: &str,
        status: EventStatus,
        retry_count: u32,
    ) -> Result<(), BlockchainError> {
        let Some(raw) = self.event_queue.get(id.as_bytes())? else {
            return Ok(());
        };
        let mut stored: StoredEvent = serde_json::from_slice(&raw)?;
        stored.event.status = status;
        stored.event.retry_count = retry_count;
        if matches!(status, EventStatus::Completed | EventStatus::Failed) {
            stored.processed_at = Some(stratos_common::time::get_current_time_in_millis());
        }
        self.event_queue
            .insert(id.as_bytes(), serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    async fn count_events_with_status(
        &self,
        status: EventStatus,
    ) -> Result<u64, BlockchainError> {
        let mut count = 0;
        for entry in self.event_queue.iter() {
            let (_, raw) = entry?;
            let stored: StoredEvent = serde_json::from_slice(&raw)?;
            if stored.event.status == status {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn is_event_seen(&self, id: &str) -> Result<bool, BlockchainError> {
        Ok(self.seen_events.contains_key(id.as_bytes())?)
    }

    async fn mark_event_seen(
        &mut self,
        id: &str,
        now: TimestampMillis,
    ) -> Result<(), BlockchainError> {
        self.seen_events.insert(id.as_bytes(), &u64_to_be(now)[..])?;
        Ok(())
    }

    async fn purge_expired_events(
        &mut self,
        now: TimestampMillis,
    ) -> Result<u64, BlockchainError> {
        let mut purged = 0;

        let seen_ttl = DEFAULT_EVENT_SEEN_TTL_SECS * 1000;
        for entry in self.seen_events.iter() {
            let (key, raw) = entry?;
            if now.saturating_sub(be_to_u64(&raw)) > seen_ttl {
                self.seen_events.remove(key)?;
                purged += 1;
            }
        }

        let completed_ttl = EVENT_COMPLETED_RETENTION_SECS * 1000;
        let failed_ttl = EVENT_FAILED_RETENTION_SECS * 1000;
        for entry in self.event_queue.iter() {
            let (key, raw) = entry?;
            let mut stored: StoredEvent = serde_json::from_slice(&raw)?;

            // claims orphaned by a crash or cancellation go back to pending
            if stored.event.status == EventStatus::Processing
                && now.saturating_sub(stored.event.timestamp) > STALE_CLAIM_SECS * 1000
            {
                stored.event.status = EventStatus::Pending;
                self.event_queue.insert(key, serde_json::to_vec(&stored)?)?;
                continue;
            }

            let Some(processed_at) = stored.processed_at else {
                continue;
            };
            let age = now.saturating_sub(processed_at);
            let expired = match stored.event.status {
                EventStatus::Completed => age > completed_ttl,
                EventStatus::Failed => age > failed_ttl,
                _ => false,
            };
            if expired {
                self.event_queue.remove(key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[async_trait]
impl SyncQueueProvider for SledStorage {
    async fn store_sync_request(&mut self, request: &SyncRequest) -> Result<(), BlockchainError> {
        self.sync_queue
            .insert(request.id.as_bytes(), serde_json::to_vec(request)?)?;
        Ok(())
    }

    async fn claim_next_sync_request(
        &mut self,
        now: TimestampMillis,
    ) -> Result<Option<SyncRequest>, BlockchainError> {
        let mut candidates = Vec::new();
        for entry in self.sync_queue.iter() {
            let (key, raw) = entry?;
            let request: SyncRequest = serde_json::from_slice(&raw)?;
            if request.status == SyncRequestStatus::Pending
                && request.scheduled_at <= now
                && request.retry_count < SYNC_QUEUE_MAX_RETRIES
            {
                candidates.push((key, request));
            }
        }
        candidates.sort_by_key(|(_, request)| (request.priority, request.scheduled_at));

        let Some((key, mut request)) = candidates.into_iter().next() else {
            return Ok(None);
        };
        request.status = SyncRequestStatus::Processing;
        self.sync_queue.insert(key, serde_json::to_vec(&request)?)?;
        Ok(Some(request))
    }

    async fn count_sync_requests(&self) -> Result<u64, BlockchainError> {
        Ok(self.sync_queue.len() as u64)
    }
}

#[async_trait]
impl RateLimitProvider for SledStorage {
    async fn load_rate_window(&self, key: &str) -> Result<Option<RateWindow>, BlockchainError> {
        match self.rate_limits.get(key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store_rate_window(
        &mut self,
        key: &str,
        window: &RateWindow,
    ) -> Result<(), BlockchainError> {
        self.rate_limits
            .insert(key.as_bytes(), serde_json::to_vec(window)?)?;
        Ok(())
    }
}

#[async_trait]
impl MempoolProvider for SledStorage {
    async fn store_mempool_tx(&mut self, tx: &Transaction) -> Result<(), BlockchainError> {
        self.mempool
            .insert(tx.hash().to_hex().as_bytes(), serde_json::to_vec(tx)?)?;
        Ok(())
    }

    async fn remove_mempool_tx(&mut self, hash: &str) -> Result<(), BlockchainError> {
        self.mempool.remove(hash.as_bytes())?;
        Ok(())
    }

    async fn load_mempool(&self) -> Result<Vec<Transaction>, BlockchainError> {
        let mut txs = Vec::new();
        for entry in self.mempool.iter() {
            let (_, raw) = entry?;
            txs.push(serde_json::from_slice(&raw)?);
        }
        // arrival order within the pool is by timestamp
        txs.sort_by_key(|tx: &Transaction| tx.timestamp());
        Ok(txs)
    }
}

#[async_trait]
impl RecoveryLogProvider for SledStorage {
    async fn append_recovery_entry(
        &mut self,
        entry: &RecoveryEntry,
    ) -> Result<(), BlockchainError> {
        let seq = self
            .extra
            .get(RECOVERY_SEQ_KEY)?
            .map(|raw| be_to_u64(&raw))
            .unwrap_or(0);
        self.recovery_log
            .insert(u64_to_be(seq), serde_json::to_vec(entry)?)?;
        self.extra.insert(RECOVERY_SEQ_KEY, &u64_to_be(seq + 1)[..])?;
        Ok(())
    }

    async fn recent_recovery_entries(
        &self,
        limit: usize,
    ) -> Result<Vec<RecoveryEntry>, BlockchainError> {
        let mut entries = Vec::new();
        for entry in self.recovery_log.iter().rev().take(limit) {
            let (_, raw) = entry?;
            entries.push(serde_json::from_slice(&raw)?);
        }
        Ok(entries)
    }
}

impl Storage for SledStorage {
    fn flush(&self) -> Result<(), BlockchainError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use stratos_common::{
        api::{EventPriority, EventType},
        block::genesis_block,
    };

    fn storage() -> SledStorage {
        SledStorage::temporary().unwrap()
    }

    fn envelope(n: u64, priority: EventPriority) -> EventEnvelope {
        EventEnvelope::new(
            EventType::BlockAdded,
            json!({ "height": n }),
            priority,
            "node-test",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_block_round_trip_and_index() {
        let mut storage = storage();
        let genesis = genesis_block(BTreeMap::new(), 1_700_000_000_000).unwrap();
        storage.save_block(&genesis).await.unwrap();

        assert_eq!(storage.count_blocks().await.unwrap(), 1);
        let by_height = storage.get_block_by_height(0).await.unwrap().unwrap();
        assert_eq!(by_height.hash(), genesis.hash());
        let by_hash = storage
            .get_block_by_hash(&genesis.hash().to_hex())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_hash.height(), 0);
    }

    #[tokio::test]
    async fn test_truncate_spares_genesis() {
        let mut storage = storage();
        let genesis = genesis_block(BTreeMap::new(), 1_700_000_000_000).unwrap();
        storage.save_block(&genesis).await.unwrap();

        let next = stratos_common::block::BlockBuilder::new(
            1,
            Vec::new(),
            genesis.hash().to_hex(),
            Vec::new(),
            BTreeMap::new(),
        )
        .with_timestamp(genesis.timestamp() + 1)
        .build()
        .unwrap();
        storage.save_block(&next).await.unwrap();

        let removed = storage.truncate_from(0).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].height(), 1);
        assert_eq!(storage.count_blocks().await.unwrap(), 1);
        assert!(storage.get_block_by_height(0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_time() {
        let mut storage = storage();
        let low = envelope(1, EventPriority::Low);
        let critical = envelope(2, EventPriority::Critical);
        let normal = envelope(3, EventPriority::Normal);
        storage
            .persist_events(&[low.clone(), critical.clone(), normal.clone()])
            .await
            .unwrap();

        let claimed = storage.claim_pending_events(10).await.unwrap();
        let ids: Vec<&str> = claimed.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, vec![&critical.id, &normal.id, &low.id]);
        assert!(claimed
            .iter()
            .all(|event| event.status == EventStatus::Processing));

        // nothing is pending anymore
        assert!(storage.claim_pending_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_is_idempotent_per_id() {
        let mut storage = storage();
        let event = envelope(7, EventPriority::Normal);
        storage.persist_events(&[event.clone()]).await.unwrap();
        storage
            .mark_event(&event.id, EventStatus::Completed, 0)
            .await
            .unwrap();
        // re-persisting the same id must not resurrect it as pending
        storage.persist_events(&[event.clone()]).await.unwrap();
        assert_eq!(
            storage
                .count_events_with_status(EventStatus::Completed)
                .await
                .unwrap(),
            1
        );
        assert!(storage.claim_pending_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seen_ttl_purge() {
        let mut storage = storage();
        storage.mark_event_seen("aa", 0).await.unwrap();
        assert!(storage.is_event_seen("aa").await.unwrap());

        let two_hours_later = DEFAULT_EVENT_SEEN_TTL_SECS * 1000 + 1;
        let purged = storage.purge_expired_events(two_hours_later).await.unwrap();
        assert_eq!(purged, 1);
        assert!(!storage.is_event_seen("aa").await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_queue_claim_order_and_schedule() {
        let mut storage = storage();
        let mut early = SyncRequest::new(
            crate::p2p::rate_limiter::SyncKind::BlockSync,
            Some("peer-a".to_string()),
            2,
            json!({}),
            100,
        );
        early.id = "early".to_string();
        let mut urgent = SyncRequest::new(
            crate::p2p::rate_limiter::SyncKind::FullSync,
            None,
            1,
            json!({}),
            150,
        );
        urgent.id = "urgent".to_string();
        let mut future = SyncRequest::new(
            crate::p2p::rate_limiter::SyncKind::TxSync,
            None,
            1,
            json!({}),
            10_000,
        );
        future.id = "future".to_string();

        for request in [&early, &urgent, &future] {
            storage.store_sync_request(request).await.unwrap();
        }

        // urgent has the best priority among runnable requests
        let claimed = storage.claim_next_sync_request(200).await.unwrap().unwrap();
        assert_eq!(claimed.id, "urgent");
        let claimed = storage.claim_next_sync_request(200).await.unwrap().unwrap();
        assert_eq!(claimed.id, "early");
        // the future request is not runnable yet
        assert!(storage.claim_next_sync_request(200).await.unwrap().is_none());
    }
}
