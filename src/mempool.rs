//! Pending transaction pool with provisional (unconfirmed) staging.
//!
//! Transactions wait here between broadcast and inclusion. A pool entry may
//! be provisionally applied: its effects are merged into the sender's
//! unconfirmed balance so later admissions see them. The chain mutator
//! reconciles the pool around every applied block: entries whose sender
//! appears in the block are provisionally undone before the block applies
//! and re-queued afterwards, dropping the ones the block invalidated.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::block::Block;
use crate::storage::Storage;
use crate::transaction::{handler_for, Transaction, TxId};

/// Errors from pool admission.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("transaction {0} already in pool")]
    Duplicate(TxId),
    #[error("pool is full ({0} transactions)")]
    Full(usize),
    #[error("transaction encoding failed: {0}")]
    Encoding(#[from] crate::transaction::TxError),
}

#[derive(Clone, Debug)]
struct Entry {
    tx: Transaction,
    applied_unconfirmed: bool,
    insertion_order: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<u64, Entry>,
    next_order: u64,
}

/// The pending pool. Interior mutability; shared behind `Arc`.
pub struct Mempool {
    max_transactions: usize,
    inner: Mutex<Inner>,
}

impl Mempool {
    pub fn new(max_transactions: usize) -> Self {
        Mempool {
            max_transactions,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a transaction. Structural admission only; provisional
    /// application is a separate step so admission never touches storage.
    pub fn add(&self, tx: Transaction) -> Result<TxId, MempoolError> {
        let id = tx.id()?;
        let mut inner = self.lock();
        if inner.entries.contains_key(&id.0) {
            return Err(MempoolError::Duplicate(id));
        }
        if inner.entries.len() >= self.max_transactions {
            return Err(MempoolError::Full(self.max_transactions));
        }
        let order = inner.next_order;
        inner.next_order += 1;
        inner.entries.insert(
            id.0,
            Entry {
                tx,
                applied_unconfirmed: false,
                insertion_order: order,
            },
        );
        Ok(id)
    }

    pub fn remove(&self, id: &TxId) -> Option<Transaction> {
        self.lock().entries.remove(&id.0).map(|e| e.tx)
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.lock().entries.contains_key(&id.0)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_applied_unconfirmed(&self, id: &TxId) -> bool {
        self.lock()
            .entries
            .get(&id.0)
            .map(|e| e.applied_unconfirmed)
            .unwrap_or(false)
    }

    pub fn mark_applied_unconfirmed(&self, id: &TxId, applied: bool) {
        if let Some(entry) = self.lock().entries.get_mut(&id.0) {
            entry.applied_unconfirmed = applied;
        }
    }

    /// Provisionally applied transactions ready for block inclusion,
    /// highest fee first (ties by admission order), bounded by count and
    /// total payload bytes.
    pub fn ready(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner
            .entries
            .values()
            .filter(|e| e.applied_unconfirmed)
            .collect();
        entries.sort_by(|a, b| {
            b.tx.fee
                .cmp(&a.tx.fee)
                .then_with(|| a.insertion_order.cmp(&b.insertion_order))
        });

        let mut out = Vec::new();
        let mut bytes = 0;
        for entry in entries {
            if out.len() == max_count {
                break;
            }
            let size = entry.tx.bytes_size();
            if bytes + size > max_bytes {
                continue;
            }
            bytes += size;
            out.push(entry.tx.clone());
        }
        out
    }

    /// Provisionally-applied pool transactions that overlap a block: their
    /// sender appears in the block, but the transaction itself does not.
    /// These must be provisionally undone before the block applies, because
    /// the block may consume the balance they assumed.
    pub fn overlapping(&self, block: &Block) -> Vec<Transaction> {
        let block_senders: Vec<_> = block.transactions.iter().map(|tx| tx.sender_id()).collect();
        let block_ids: Vec<u64> = block
            .transactions
            .iter()
            .filter_map(|tx| tx.id().ok())
            .map(|id| id.0)
            .collect();

        let inner = self.lock();
        let mut out: Vec<&Entry> = inner
            .entries
            .iter()
            .filter(|(id, entry)| {
                entry.applied_unconfirmed
                    && !block_ids.contains(id)
                    && block_senders.contains(&entry.tx.sender_id())
            })
            .map(|(_, entry)| entry)
            .collect();
        out.sort_by_key(|e| e.insertion_order);
        out.iter().map(|e| e.tx.clone()).collect()
    }

    /// Drop every transaction the block confirmed.
    pub fn remove_block_transactions(&self, block: &Block) {
        let mut inner = self.lock();
        for tx in &block.transactions {
            if let Ok(id) = tx.id() {
                inner.entries.remove(&id.0);
            }
        }
    }

    /// Re-apply previously-undone overlapping transactions against current
    /// state. Each re-application is its own storage unit; transactions the
    /// block made invalid are dropped from the pool. Returns the number
    /// dropped.
    pub fn requeue(&self, txs: &[Transaction], storage: &dyn Storage) -> usize {
        let mut dropped = 0;
        for tx in txs {
            let Ok(id) = tx.id() else {
                dropped += 1;
                continue;
            };
            if !self.contains(&id) {
                continue;
            }
            match self.try_apply_unconfirmed(tx, storage) {
                Ok(()) => self.mark_applied_unconfirmed(&id, true),
                Err(e) => {
                    debug!(tx = %id, error = %e, "dropping invalidated pool transaction");
                    self.remove(&id);
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Provisionally apply one pool transaction as its own storage unit.
    pub fn try_apply_unconfirmed(
        &self,
        tx: &Transaction,
        storage: &dyn Storage,
    ) -> Result<(), String> {
        let sender = storage
            .account(tx.sender_id())
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("unknown sender {}", tx.sender_id()))?;
        let handler = handler_for(tx.tx_type);
        let ops = handler
            .apply_unconfirmed(tx, &sender)
            .map_err(|e| e.to_string())?;
        storage.commit(&ops).map_err(|e| e.to_string())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Address;
    use crate::crypto::{Keypair, Signature};
    use crate::transaction::{TxAsset, TxType};

    fn pool_tx(secret: &str, fee: u128) -> Transaction {
        let kp = Keypair::from_secret(secret);
        let mut tx = Transaction {
            tx_type: TxType::Transfer,
            timestamp: 7,
            sender_public_key: kp.public,
            recipient_id: Some(Address(1)),
            amount: 100,
            fee,
            signature: Signature::empty(),
            asset: TxAsset::None,
        };
        tx.sign(&kp).unwrap();
        tx
    }

    #[test]
    fn add_remove_and_duplicates() {
        let pool = Mempool::new(10);
        let tx = pool_tx("pool a", 10);
        let id = pool.add(tx.clone()).unwrap();
        assert!(pool.contains(&id));
        assert!(matches!(
            pool.add(tx),
            Err(MempoolError::Duplicate(other)) if other == id
        ));
        assert!(pool.remove(&id).is_some());
        assert!(pool.is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        let pool = Mempool::new(1);
        pool.add(pool_tx("cap a", 1)).unwrap();
        assert!(matches!(
            pool.add(pool_tx("cap b", 1)),
            Err(MempoolError::Full(1))
        ));
    }

    #[test]
    fn ready_orders_by_fee_and_respects_bounds() {
        let pool = Mempool::new(10);
        for (secret, fee) in [("r low", 1u128), ("r high", 50), ("r mid", 25)] {
            let id = pool.add(pool_tx(secret, fee)).unwrap();
            pool.mark_applied_unconfirmed(&id, true);
        }
        let ready = pool.ready(2, usize::MAX);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].fee, 50);
        assert_eq!(ready[1].fee, 25);

        // Unapplied entries are never drafted.
        let pool2 = Mempool::new(10);
        pool2.add(pool_tx("r idle", 9)).unwrap();
        assert!(pool2.ready(10, usize::MAX).is_empty());
    }
}
