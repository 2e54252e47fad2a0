// Batch event processor
//
// Producers submit envelopes into a bounded in-memory queue that is flushed
// to durable storage when it fills to the batch size, when the interval
// elapses, when a critical event arrives, or at shutdown. Dedup happens at
// submission against the seen set (2h TTL). Consumers claim persisted
// batches ordered by priority then arrival, and every event walks
// pending -> processing -> completed | failed with bounded retries.

use log::{debug, trace, warn};
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{Mutex, Notify, RwLock};

use stratos_common::{
    api::{EventEnvelope, EventPriority, EventStatus},
    time::get_current_time_in_millis,
};

use crate::core::{error::BlockchainError, storage::Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// The id is already in the seen set; the caller treats this as success.
    Duplicate,
    /// Queue and store are both saturated; retry after the flush interval.
    Backpressure,
}

pub struct ProcessorConfig {
    pub batch_size: usize,
    pub max_queue_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub deduplicate: bool,
}

pub struct BatchEventProcessor<S: Storage> {
    storage: Arc<RwLock<S>>,
    queue: Mutex<VecDeque<EventEnvelope>>,
    flush_signal: Notify,
    config: ProcessorConfig,
}

impl<S: Storage> BatchEventProcessor<S> {
    pub fn new(storage: Arc<RwLock<S>>, config: ProcessorConfig) -> Self {
        BatchEventProcessor {
            storage,
            queue: Mutex::new(VecDeque::new()),
            flush_signal: Notify::new(),
            config,
        }
    }

    pub fn flush_interval_ms(&self) -> u64 {
        self.config.flush_interval_ms
    }

    /// Wait until someone asks for an early flush.
    pub async fn flush_requested(&self) {
        self.flush_signal.notified().await;
    }

    /// Submit one envelope. Deduplicates by id, enforces the queue bound
    /// and wakes the flusher for high-priority arrivals.
    pub async fn submit(&self, event: EventEnvelope) -> Result<SubmitOutcome, BlockchainError> {
        if self.config.deduplicate {
            let seen = self.storage.read().await.is_event_seen(&event.id).await?;
            if seen {
                trace!("event {} suppressed as duplicate", event.id);
                return Ok(SubmitOutcome::Duplicate);
            }
            self.storage
                .write()
                .await
                .mark_event_seen(&event.id, get_current_time_in_millis())
                .await?;
        }

        let high_priority = event.priority <= EventPriority::High;
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.config.max_queue_size {
                drop(queue);
                // producers force a flush at capacity
                self.flush().await?;
                let mut queue = self.queue.lock().await;
                if queue.len() >= self.config.max_queue_size {
                    warn!("event queue saturated, signalling backpressure");
                    return Ok(SubmitOutcome::Backpressure);
                }
                queue.push_back(event);
            } else {
                queue.push_back(event);
            }
        }

        let queued = self.queue.lock().await.len();
        if queued >= self.config.batch_size || high_priority {
            self.flush_signal.notify_one();
        }
        Ok(SubmitOutcome::Accepted)
    }

    /// Drain the in-memory queue into the durable store.
    pub async fn flush(&self) -> Result<usize, BlockchainError> {
        let drained: Vec<EventEnvelope> = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(0);
        }
        debug!("flushing {} events to storage", drained.len());
        self.storage.write().await.persist_events(&drained).await?;
        Ok(drained.len())
    }

    /// Claim the next persisted batch for dispatch.
    pub async fn claim_batch(&self) -> Result<Vec<EventEnvelope>, BlockchainError> {
        self.storage
            .write()
            .await
            .claim_pending_events(self.config.batch_size)
            .await
    }

    pub async fn complete(&self, event: &EventEnvelope) -> Result<(), BlockchainError> {
        self.storage
            .write()
            .await
            .mark_event(&event.id, EventStatus::Completed, event.retry_count)
            .await
    }

    /// Failed events return to pending until retries run out.
    pub async fn fail(&self, event: &EventEnvelope) -> Result<(), BlockchainError> {
        let retries = event.retry_count + 1;
        let status = if retries >= self.config.max_retries {
            warn!(
                "event {} failed permanently after {} attempts",
                event.id, retries
            );
            EventStatus::Failed
        } else {
            EventStatus::Pending
        };
        self.storage
            .write()
            .await
            .mark_event(&event.id, status, retries)
            .await
    }

    pub async fn pending_count(&self) -> Result<u64, BlockchainError> {
        let persisted = self
            .storage
            .read()
            .await
            .count_events_with_status(EventStatus::Pending)
            .await?;
        Ok(persisted + self.queue.lock().await.len() as u64)
    }

    pub async fn failed_count(&self) -> Result<u64, BlockchainError> {
        self.storage
            .read()
            .await
            .count_events_with_status(EventStatus::Failed)
            .await
    }

    /// Retention pass: drop expired seen entries and terminal events.
    pub async fn cleanup(&self) -> Result<u64, BlockchainError> {
        self.storage
            .write()
            .await
            .purge_expired_events(get_current_time_in_millis())
            .await
    }

    /// Final flush for shutdown.
    pub async fn shutdown(&self) -> Result<(), BlockchainError> {
        self.flush().await?;
        Ok(())
    }
}
