// Pending transaction pool
//
// Keyed by hash, iterated in arrival order. The pool is an in-memory view;
// the storage mirror is written by the chain manager so a restart can
// rebuild it.

use indexmap::IndexMap;
use log::trace;

use stratos_common::{
    crypto::Hash,
    time::TimestampMillis,
    transaction::Transaction,
};

pub struct Mempool {
    txs: IndexMap<Hash, Transaction>,
    capacity: usize,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Mempool {
            txs: IndexMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.txs.len() >= self.capacity
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.txs.contains_key(hash)
    }

    /// Insert preserving arrival order. Returns false on duplicates.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        if self.txs.contains_key(tx.hash()) {
            return false;
        }
        trace!("mempool accepts {}", tx.hash());
        self.txs.insert(tx.hash().clone(), tx);
        true
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        self.txs.shift_remove(hash)
    }

    /// The first `max` transactions in arrival order, for block building.
    pub fn select(&self, max: usize) -> Vec<Transaction> {
        self.txs.values().take(max).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.values()
    }

    /// Total amount+fee an address has committed across pending entries.
    pub fn pending_spend_of(&self, address: &str) -> u64 {
        self.txs
            .values()
            .filter(|tx| tx.from_address() == address)
            .map(|tx| tx.total_cost())
            .sum()
    }

    /// Drop everything confirmed by a block. Returns how many were removed.
    pub fn remove_confirmed(&mut self, confirmed: impl IntoIterator<Item = Hash>) -> usize {
        let mut removed = 0;
        for hash in confirmed {
            if self.txs.shift_remove(&hash).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn count_older_than(&self, cutoff: TimestampMillis) -> usize {
        self.txs.values().filter(|tx| tx.timestamp() < cutoff).count()
    }

    /// Purge transactions created before `cutoff`, returning them.
    pub fn purge_older_than(&mut self, cutoff: TimestampMillis) -> Vec<Transaction> {
        let stale: Vec<Hash> = self
            .txs
            .values()
            .filter(|tx| tx.timestamp() < cutoff)
            .map(|tx| tx.hash().clone())
            .collect();
        stale
            .iter()
            .filter_map(|hash| self.txs.shift_remove(hash))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratos_common::crypto::KeyPair;

    fn tx(keypair: &KeyPair, nonce: u64, timestamp: TimestampMillis) -> Transaction {
        Transaction::create(
            keypair, "rcpt".to_string(), 5, 1, nonce, 21_000, 1, None, timestamp,
        )
        .unwrap()
    }

    #[test]
    fn test_arrival_order_and_dedup() {
        let keypair = KeyPair::generate();
        let mut pool = Mempool::new(10);
        let first = tx(&keypair, 0, 100);
        let second = tx(&keypair, 1, 50);

        assert!(pool.insert(first.clone()));
        assert!(pool.insert(second.clone()));
        assert!(!pool.insert(first.clone()));

        // selection is arrival order, not timestamp order
        let selected = pool.select(10);
        assert_eq!(selected[0].hash(), first.hash());
        assert_eq!(selected[1].hash(), second.hash());
    }

    #[test]
    fn test_pending_spend_accumulates() {
        let keypair = KeyPair::generate();
        let mut pool = Mempool::new(10);
        pool.insert(tx(&keypair, 0, 100));
        pool.insert(tx(&keypair, 1, 100));
        assert_eq!(pool.pending_spend_of(&keypair.address()), 12);
        assert_eq!(pool.pending_spend_of("someone-else"), 0);
    }

    #[test]
    fn test_purge_older_than() {
        let keypair = KeyPair::generate();
        let mut pool = Mempool::new(10);
        pool.insert(tx(&keypair, 0, 100));
        pool.insert(tx(&keypair, 1, 5_000));

        assert_eq!(pool.count_older_than(1_000), 1);
        let purged = pool.purge_older_than(1_000);
        assert_eq!(purged.len(), 1);
        assert_eq!(pool.len(), 1);
    }
}
