// Per-(operation, peer) rate limiting
//
// Sliding 60-second windows keyed by `syncType||peerId`. Denied work is not
// an error: it lands in the durable deferred queue with a priority and a
// scheduled time, and is retried with exponential backoff. The limiter
// itself must never wedge sync: any storage trouble fails open.

use dashmap::DashMap;
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use strum::Display;
use tokio::sync::RwLock;

use stratos_common::time::{
    get_current_time_in_millis, get_current_time_in_seconds, TimestampMillis, TimestampSeconds,
};

use crate::{
    config::{
        RATE_LIMIT_WINDOW_SECS, SYNC_QUEUE_BACKOFF_BASE_SECS, SYNC_QUEUE_BACKOFF_CAP_SECS,
        SYNC_QUEUE_MAX_RETRIES,
    },
    core::{error::BlockchainError, storage::Storage},
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncKind {
    BlockSync,
    TxSync,
    MempoolSync,
    WalletSync,
    FullSync,
}

/// Requests-per-minute budgets per sync kind.
#[derive(Debug, Clone, Copy)]
pub struct RateBudgets {
    pub block_sync: u32,
    pub tx_sync: u32,
    pub mempool_sync: u32,
    pub wallet_sync: u32,
    pub full_sync: u32,
}

impl RateBudgets {
    pub fn limit_for(&self, kind: SyncKind) -> u32 {
        match kind {
            SyncKind::BlockSync => self.block_sync,
            SyncKind::TxSync => self.tx_sync,
            SyncKind::MempoolSync => self.mempool_sync,
            SyncKind::WalletSync => self.wallet_sync,
            SyncKind::FullSync => self.full_sync,
        }
    }
}

impl Default for RateBudgets {
    fn default() -> Self {
        RateBudgets {
            block_sync: crate::config::DEFAULT_BLOCK_SYNC_RPM,
            tx_sync: crate::config::DEFAULT_TX_SYNC_RPM,
            mempool_sync: crate::config::DEFAULT_MEMPOOL_SYNC_RPM,
            wallet_sync: crate::config::DEFAULT_WALLET_SYNC_RPM,
            full_sync: crate::config::DEFAULT_FULL_SYNC_RPM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: TimestampSeconds,
    pub blocked_until: TimestampSeconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied until the given time; the caller defers, it does not fail.
    Deferred(TimestampSeconds),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncRequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A deferred sync operation waiting in the durable priority queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: String,
    pub kind: SyncKind,
    pub peer: Option<String>,
    // lower value preempts higher
    pub priority: u8,
    pub payload: Value,
    pub scheduled_at: TimestampMillis,
    pub status: SyncRequestStatus,
    pub retry_count: u32,
}

impl SyncRequest {
    pub fn new(
        kind: SyncKind,
        peer: Option<String>,
        priority: u8,
        payload: Value,
        scheduled_at: TimestampMillis,
    ) -> Self {
        let nonce: u64 = rand::thread_rng().gen();
        SyncRequest {
            id: format!("{}-{:016x}", kind, nonce),
            kind,
            peer,
            priority,
            payload,
            scheduled_at,
            status: SyncRequestStatus::Pending,
            retry_count: 0,
        }
    }
}

pub struct RateLimiter<S: Storage> {
    storage: Arc<RwLock<S>>,
    budgets: RateBudgets,
    // authoritative in-memory windows; storage is a best-effort mirror so
    // limits survive restart
    windows: DashMap<String, RateWindow>,
}

impl<S: Storage> RateLimiter<S> {
    pub fn new(storage: Arc<RwLock<S>>, budgets: RateBudgets) -> Self {
        RateLimiter {
            storage,
            budgets,
            windows: DashMap::new(),
        }
    }

    fn key(kind: SyncKind, peer_id: &str) -> String {
        format!("{}{}", kind, peer_id)
    }

    /// Apply the sliding-window rule for one request.
    pub async fn allow(&self, kind: SyncKind, peer_id: &str) -> RateDecision {
        self.allow_at(kind, peer_id, get_current_time_in_seconds())
            .await
    }

    pub async fn allow_at(
        &self,
        kind: SyncKind,
        peer_id: &str,
        now: TimestampSeconds,
    ) -> RateDecision {
        let key = Self::key(kind, peer_id);
        let limit = self.budgets.limit_for(kind);

        if !self.windows.contains_key(&key) {
            // first sighting: recover any persisted window, failing open
            match self.storage.read().await.load_rate_window(&key).await {
                Ok(Some(window)) => {
                    self.windows.insert(key.clone(), window);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("rate window load failed for {}: {}, failing open", key, error);
                }
            }
        }

        let decision;
        let updated = {
            let mut entry = self.windows.entry(key.clone()).or_insert(RateWindow {
                count: 0,
                window_start: now,
                blocked_until: 0,
            });
            let window = entry.value_mut();

            if window.blocked_until > now {
                decision = RateDecision::Deferred(window.blocked_until);
            } else if now.saturating_sub(window.window_start) >= RATE_LIMIT_WINDOW_SECS {
                window.count = 1;
                window.window_start = now;
                window.blocked_until = 0;
                decision = RateDecision::Allowed;
            } else if window.count >= limit {
                window.blocked_until = window.window_start + RATE_LIMIT_WINDOW_SECS;
                decision = RateDecision::Deferred(window.blocked_until);
            } else {
                window.count += 1;
                decision = RateDecision::Allowed;
            }
            *window
        };

        if let Err(error) = self
            .storage
            .write()
            .await
            .store_rate_window(&key, &updated)
            .await
        {
            // fail open: losing a mirror write never blocks sync
            warn!("rate window store failed for {}: {}", key, error);
        }
        decision
    }

    /// Defer an operation into the durable priority queue.
    pub async fn enqueue(
        &self,
        kind: SyncKind,
        payload: Value,
        peer: Option<String>,
        priority: u8,
        delay_ms: u64,
    ) -> Result<SyncRequest, BlockchainError> {
        let request = SyncRequest::new(
            kind,
            peer,
            priority,
            payload,
            get_current_time_in_millis() + delay_ms,
        );
        self.storage
            .write()
            .await
            .store_sync_request(&request)
            .await?;
        debug!("deferred {} request {} (priority {})", kind, request.id, priority);
        Ok(request)
    }

    /// Claim the next runnable deferred request, if any.
    pub async fn dequeue_next(&self) -> Result<Option<SyncRequest>, BlockchainError> {
        self.storage
            .write()
            .await
            .claim_next_sync_request(get_current_time_in_millis())
            .await
    }

    pub async fn complete(&self, mut request: SyncRequest) -> Result<(), BlockchainError> {
        request.status = SyncRequestStatus::Completed;
        self.storage
            .write()
            .await
            .store_sync_request(&request)
            .await
    }

    /// Return a failed request to the queue with exponential backoff, or
    /// mark it failed once retries are exhausted.
    pub async fn fail(&self, mut request: SyncRequest) -> Result<(), BlockchainError> {
        request.retry_count += 1;
        if request.retry_count >= SYNC_QUEUE_MAX_RETRIES {
            request.status = SyncRequestStatus::Failed;
        } else {
            let backoff_secs = (SYNC_QUEUE_BACKOFF_BASE_SECS
                << request.retry_count.min(16))
            .min(SYNC_QUEUE_BACKOFF_CAP_SECS);
            request.status = SyncRequestStatus::Pending;
            request.scheduled_at = get_current_time_in_millis() + backoff_secs * 1000;
        }
        self.storage
            .write()
            .await
            .store_sync_request(&request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::SledStorage;
    use serde_json::json;

    fn limiter() -> RateLimiter<SledStorage> {
        let storage = Arc::new(RwLock::new(SledStorage::temporary().unwrap()));
        RateLimiter::new(storage, RateBudgets::default())
    }

    #[tokio::test]
    async fn test_mempool_budget_is_enforced() {
        let limiter = limiter();
        let now = 10_000;

        for _ in 0..30 {
            assert_eq!(
                limiter.allow_at(SyncKind::MempoolSync, "peer-a", now).await,
                RateDecision::Allowed
            );
        }
        // 31st request in the window blocks until the window end
        assert_eq!(
            limiter.allow_at(SyncKind::MempoolSync, "peer-a", now).await,
            RateDecision::Deferred(now + RATE_LIMIT_WINDOW_SECS)
        );
        // and keeps blocking within the window
        assert_eq!(
            limiter
                .allow_at(SyncKind::MempoolSync, "peer-a", now + 30)
                .await,
            RateDecision::Deferred(now + RATE_LIMIT_WINDOW_SECS)
        );
    }

    #[tokio::test]
    async fn test_window_reset_allows_again() {
        let limiter = limiter();
        let now = 10_000;
        for _ in 0..6 {
            limiter.allow_at(SyncKind::FullSync, "peer-a", now).await;
        }
        assert!(matches!(
            limiter.allow_at(SyncKind::FullSync, "peer-a", now).await,
            RateDecision::Deferred(_)
        ));
        // next window start clears both the block and the count
        assert_eq!(
            limiter
                .allow_at(SyncKind::FullSync, "peer-a", now + RATE_LIMIT_WINDOW_SECS)
                .await,
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter();
        let now = 10_000;
        for _ in 0..6 {
            limiter.allow_at(SyncKind::FullSync, "peer-a", now).await;
        }
        assert!(matches!(
            limiter.allow_at(SyncKind::FullSync, "peer-a", now).await,
            RateDecision::Deferred(_)
        ));
        // another peer and another kind are unaffected
        assert_eq!(
            limiter.allow_at(SyncKind::FullSync, "peer-b", now).await,
            RateDecision::Allowed
        );
        assert_eq!(
            limiter.allow_at(SyncKind::BlockSync, "peer-a", now).await,
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_deferred_queue_backoff() {
        let limiter = limiter();
        let request = limiter
            .enqueue(SyncKind::BlockSync, json!({"start": 5}), None, 1, 0)
            .await
            .unwrap();

        let claimed = limiter.dequeue_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, request.id);
        assert_eq!(claimed.status, SyncRequestStatus::Processing);

        // first failure reschedules with backoff instead of completing
        limiter.fail(claimed).await.unwrap();
        assert!(limiter.dequeue_next().await.unwrap().is_none());
    }
}
