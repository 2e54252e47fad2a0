// Durable storage
//
// Split into provider traits the way the chain components consume them:
// blocks, the durable event queue, the deferred sync queue, rate-limit
// windows, the mempool mirror and the recovery log. `SledStorage` is the
// backend implementing all of them.

mod sled_storage;

use async_trait::async_trait;

use stratos_common::{
    api::{EventEnvelope, EventStatus},
    block::{Block, BlockHeight},
    time::TimestampMillis,
    transaction::Transaction,
};

use crate::{
    core::{error::BlockchainError, recovery::RecoveryEntry},
    p2p::rate_limiter::{RateWindow, SyncRequest},
};

pub use sled_storage::SledStorage;

#[async_trait]
pub trait BlockProvider {
    /// Append a block at height `count()`. The by-hash index and the block
    /// count move in the same atomic batch; the write is durable before
    /// this returns.
    async fn save_block(&mut self, block: &Block) -> Result<(), BlockchainError>;

    async fn get_block_by_height(
        &self,
        height: BlockHeight,
    ) -> Result<Option<Block>, BlockchainError>;

    async fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, BlockchainError>;

    async fn count_blocks(&self) -> Result<u64, BlockchainError>;

    /// Remove every block at `height` and above, returning them newest
    /// first. Used by reorganization; genesis (height 0) is never removed.
    async fn truncate_from(&mut self, height: BlockHeight)
        -> Result<Vec<Block>, BlockchainError>;
}

#[async_trait]
pub trait EventQueueProvider {
    /// Persist a flushed batch. Events already present keep their stored
    /// status.
    async fn persist_events(&mut self, events: &[EventEnvelope]) -> Result<(), BlockchainError>;

    /// Claim up to `limit` pending events ordered by priority then
    /// timestamp, transitioning each to `processing`. Only events whose
    /// stored status is still `pending` are claimable.
    async fn claim_pending_events(
        &mut self,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, BlockchainError>;

    async fn mark_event(
        &mut self,
        id: &str,
        status: EventStatus,
        retry_count: u32,
    ) -> Result<(), BlockchainError>;

    async fn count_events_with_status(&self, status: EventStatus)
        -> Result<u64, BlockchainError>;

    async fn is_event_seen(&self, id: &str) -> Result<bool, BlockchainError>;

    async fn mark_event_seen(
        &mut self,
        id: &str,
        now: TimestampMillis,
    ) -> Result<(), BlockchainError>;

    /// Drop expired seen-set entries, completed events past the one-day
    /// retention and failed events past the seven-day retention. Returns
    /// the number of records purged.
    async fn purge_expired_events(
        &mut self,
        now: TimestampMillis,
    ) -> Result<u64, BlockchainError>;
}

#[async_trait]
pub trait SyncQueueProvider {
    async fn store_sync_request(&mut self, request: &SyncRequest) -> Result<(), BlockchainError>;

    /// Claim the runnable deferred request with the highest priority
    /// (lowest value), oldest first, scheduled at or before `now`, with
    /// retries left; atomically transitions it to `processing`.
    async fn claim_next_sync_request(
        &mut self,
        now: TimestampMillis,
    ) -> Result<Option<SyncRequest>, BlockchainError>;

    async fn count_sync_requests(&self) -> Result<u64, BlockchainError>;
}

#[async_trait]
pub trait RateLimitProvider {
    async fn load_rate_window(&self, key: &str) -> Result<Option<RateWindow>, BlockchainError>;

    async fn store_rate_window(
        &mut self,
        key: &str,
        window: &RateWindow,
    ) -> Result<(), BlockchainError>;
}

#[async_trait]
pub trait MempoolProvider {
    async fn store_mempool_tx(&mut self, tx: &Transaction) -> Result<(), BlockchainError>;

    async fn remove_mempool_tx(&mut self, hash: &str) -> Result<(), BlockchainError>;

    async fn load_mempool(&self) -> Result<Vec<Transaction>, BlockchainError>;
}

#[async_trait]
pub trait RecoveryLogProvider {
    async fn append_recovery_entry(
        &mut self,
        entry: &RecoveryEntry,
    ) -> Result<(), BlockchainError>;

    async fn recent_recovery_entries(
        &self,
        limit: usize,
    ) -> Result<Vec<RecoveryEntry>, BlockchainError>;
}

pub trait Storage:
    BlockProvider
    + EventQueueProvider
    + SyncQueueProvider
    + RateLimitProvider
    + MempoolProvider
    + RecoveryLogProvider
    + Send
    + Sync
    + 'static
{
    /// Flush every tree to disk. Called on shutdown.
    fn flush(&self) -> Result<(), BlockchainError>;
}
