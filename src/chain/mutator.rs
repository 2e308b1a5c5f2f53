//! Atomic chain mutation: apply a block, delete the last block, bootstrap
//! genesis.
//!
//! Every mutation assembles one list of storage operations and commits it as
//! a single atomic unit: transaction effects, pool reconciliation deltas,
//! the block row, and the round engine's boundary accounting all land or
//! none do. A working account view tracks in-flight effects so each
//! transaction in a block sees its predecessors.
//!
//! Callers serialize access: the processor holds the single writer lock
//! around every mutator call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::account::{Account, Address};
use crate::block::Block;
use crate::chain::ChainError;
use crate::mempool::Mempool;
use crate::rounds::RoundEngine;
use crate::storage::{RoundRow, Storage, StorageOp};
use crate::transaction::{handler_for, Transaction, TxAsset, TxType};
use crate::ChainParams;

/// A read-through account view layered over storage, kept consistent with
/// the operation list being assembled so later transactions in a block see
/// earlier effects before anything commits.
struct WorkingAccounts<'a> {
    storage: &'a dyn Storage,
    cache: HashMap<u64, Account>,
}

impl<'a> WorkingAccounts<'a> {
    fn new(storage: &'a dyn Storage) -> Self {
        WorkingAccounts {
            storage,
            cache: HashMap::new(),
        }
    }

    fn get(&mut self, address: Address) -> Result<Account, ChainError> {
        if let Some(account) = self.cache.get(&address.0) {
            return Ok(account.clone());
        }
        let account = self
            .storage
            .account(address)?
            .unwrap_or_else(|| Account::new(address));
        self.cache.insert(address.0, account.clone());
        Ok(account)
    }

    /// Mirror account-affecting ops into the cache. Block and round-table
    /// ops pass through untouched.
    fn track(&mut self, ops: &[StorageOp]) -> Result<(), ChainError> {
        for op in ops {
            match op {
                StorageOp::EnsureAccount {
                    address,
                    public_key,
                } => {
                    let mut account = self.get(*address)?;
                    if account.public_key.is_none() {
                        account.public_key = *public_key;
                    }
                    self.cache.insert(address.0, account);
                }
                StorageOp::MergeAccount(address, delta) => {
                    let mut account = self.get(*address)?;
                    account
                        .merge(delta)
                        .map_err(crate::storage::StorageError::from)?;
                    self.cache.insert(address.0, account);
                }
                StorageOp::SetDelegate {
                    address,
                    username,
                    is_delegate,
                } => {
                    let mut account = self.get(*address)?;
                    account.username = username.clone();
                    account.is_delegate = *is_delegate;
                    self.cache.insert(address.0, account);
                }
                StorageOp::SetVotes {
                    address,
                    added,
                    removed,
                } => {
                    let mut account = self.get(*address)?;
                    account.votes.retain(|key| !removed.contains(key));
                    for key in added {
                        if !account.votes.contains(key) {
                            account.votes.push(*key);
                        }
                    }
                    self.cache.insert(address.0, account);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

pub struct ChainMutator {
    params: Arc<ChainParams>,
    storage: Arc<dyn Storage>,
    mempool: Arc<Mempool>,
    rounds: Arc<RoundEngine>,
    is_processing: AtomicBool,
    is_cleaning: AtomicBool,
}

impl ChainMutator {
    pub fn new(
        params: Arc<ChainParams>,
        storage: Arc<dyn Storage>,
        mempool: Arc<Mempool>,
        rounds: Arc<RoundEngine>,
    ) -> Self {
        ChainMutator {
            params,
            storage,
            mempool,
            rounds,
            is_processing: AtomicBool::new(false),
            is_cleaning: AtomicBool::new(false),
        }
    }

    /// Apply a verified block as one atomic unit, reconciling the pending
    /// pool around it.
    pub fn apply_block(&self, block: &Block, save: bool) -> Result<(), ChainError> {
        if self.is_cleaning.load(Ordering::SeqCst) {
            return Err(ChainError::ShuttingDown);
        }
        self.is_processing.store(true, Ordering::SeqCst);
        let result = self.apply_block_inner(block, save);
        self.is_processing.store(false, Ordering::SeqCst);

        let overlapping = result?;
        // The unit committed. Reconcile the pool: confirmed transactions
        // leave, provisionally-undone overlaps re-queue (and drop if the
        // block invalidated them).
        self.mempool.remove_block_transactions(block);
        for tx in &overlapping {
            if let Ok(id) = tx.id() {
                self.mempool.mark_applied_unconfirmed(&id, false);
            }
        }
        let dropped = self.mempool.requeue(&overlapping, self.storage.as_ref());
        if dropped > 0 {
            info!(dropped, "pool transactions invalidated by block");
        }
        Ok(())
    }

    fn apply_block_inner(&self, block: &Block, save: bool) -> Result<Vec<Transaction>, ChainError> {
        let mut ops: Vec<StorageOp> = Vec::new();
        let mut accounts = WorkingAccounts::new(self.storage.as_ref());

        // Pool transactions from the block's senders that are not in the
        // block get their provisional effects undone first; the block may
        // consume the balance they assumed.
        let overlapping = self.mempool.overlapping(block);
        for tx in &overlapping {
            let undo = handler_for(tx.tx_type).undo_unconfirmed(tx)?;
            accounts.track(&undo)?;
            ops.extend(undo);
        }

        let round = self.rounds.calc_round(block.height);
        let mut round_rows: Vec<RoundRow> = Vec::new();
        let mut row_idx: u32 = 0;

        for tx in &block.transactions {
            let tx_id = tx.id()?;
            let sender_address = tx.sender_id();

            let ensure_sender = StorageOp::EnsureAccount {
                address: sender_address,
                public_key: Some(tx.sender_public_key),
            };
            accounts.track(std::slice::from_ref(&ensure_sender))?;
            ops.push(ensure_sender);
            if let Some(recipient) = tx.recipient_id {
                let ensure = StorageOp::EnsureAccount {
                    address: recipient,
                    public_key: None,
                };
                accounts.track(std::slice::from_ref(&ensure))?;
                ops.push(ensure);
            }

            let handler = handler_for(tx.tx_type);
            if !self.mempool.is_applied_unconfirmed(&tx_id) {
                let sender = accounts.get(sender_address)?;
                let provisional = handler.apply_unconfirmed(tx, &sender)?;
                accounts.track(&provisional)?;
                ops.extend(provisional);
            }

            let sender = accounts.get(sender_address)?;
            let confirmed = handler.apply(tx, &sender)?;

            // Record one round working row per voted delegate for every
            // confirmed balance change, before folding the ops in.
            for op in &confirmed {
                if let StorageOp::MergeAccount(address, delta) = op {
                    if delta.balance == 0 {
                        continue;
                    }
                    let voter = accounts.get(*address)?;
                    for delegate in &voter.votes {
                        let row = RoundRow {
                            round,
                            height: block.height,
                            idx: row_idx,
                            block_id: block.id,
                            address: *address,
                            delegate: *delegate,
                            amount: delta.balance,
                        };
                        row_idx += 1;
                        ops.push(StorageOp::CreateRoundRow(row.clone()));
                        round_rows.push(row);
                    }
                }
            }
            accounts.track(&confirmed)?;
            ops.extend(confirmed);
        }

        if save {
            ops.push(StorageOp::CreateBlock(Box::new(block.clone())));
        }

        // Round boundary accounting joins the same atomic unit.
        ops.extend(self.rounds.tick_forward(block, &round_rows)?);

        self.storage.commit(&ops).map_err(|e| {
            error!(block = %block.id, height = block.height, error = %e, "block apply rolled back");
            e
        })?;
        Ok(overlapping)
    }

    /// Delete the current last block, undoing every transaction in reverse
    /// order inside one atomic unit. Returns the new last block.
    pub fn delete_last_block(&self) -> Result<Block, ChainError> {
        if self.is_cleaning.load(Ordering::SeqCst) {
            return Err(ChainError::ShuttingDown);
        }
        let last = self
            .storage
            .last_block()?
            .ok_or_else(|| ChainError::MissingBlock("chain is empty".into()))?;
        if last.height == 1 || last.previous_block.is_none() {
            return Err(ChainError::GenesisDelete);
        }
        let previous_id = last.previous_block.ok_or(ChainError::GenesisDelete)?;
        let previous = self
            .storage
            .block_by_id(&previous_id)?
            .ok_or_else(|| ChainError::MissingBlock(previous_id.to_string()))?;

        self.is_processing.store(true, Ordering::SeqCst);
        let result = self.delete_inner(&last, &previous);
        self.is_processing.store(false, Ordering::SeqCst);
        result?;

        info!(deleted = %last.id, height = last.height, "last block deleted");
        Ok(previous)
    }

    fn delete_inner(&self, last: &Block, previous: &Block) -> Result<(), ChainError> {
        let mut ops: Vec<StorageOp> = Vec::new();
        let mut accounts = WorkingAccounts::new(self.storage.as_ref());

        for tx in last.transactions.iter().rev() {
            let handler = handler_for(tx.tx_type);
            let sender = accounts.get(tx.sender_id())?;
            let confirmed_undo = handler.undo(tx, &sender)?;
            accounts.track(&confirmed_undo)?;
            ops.extend(confirmed_undo);
            let provisional_undo = handler.undo_unconfirmed(tx)?;
            accounts.track(&provisional_undo)?;
            ops.extend(provisional_undo);
        }

        ops.extend(self.rounds.tick_backward(last, previous)?);
        ops.push(StorageOp::RemoveRoundRows(last.id));
        ops.push(StorageOp::RemoveBlock(last.id));

        self.storage.commit(&ops).map_err(|e| {
            error!(block = %last.id, error = %e, "block delete rolled back");
            ChainError::from(e)
        })
    }

    /// Bootstrap application of the genesis block: every transaction lands
    /// by direct account assignment, bypassing the provisional/confirmed
    /// staging, with vote transactions reordered to apply last. Any failure
    /// is genesis corruption; the caller must treat it as fatal.
    pub fn apply_genesis_block(&self, block: &Block) -> Result<(), ChainError> {
        self.apply_genesis_inner(block)
            .map_err(|e| ChainError::GenesisCorruption(e.to_string()))
    }

    fn apply_genesis_inner(&self, block: &Block) -> Result<(), ChainError> {
        let mut transactions = block.transactions.clone();
        transactions.sort_by_key(|tx| {
            (
                tx.tx_type.genesis_order(),
                tx.id().map(|id| id.0).unwrap_or(u64::MAX),
            )
        });

        let mut ops: Vec<StorageOp> = Vec::new();
        let mut accounts = WorkingAccounts::new(self.storage.as_ref());
        for tx in &transactions {
            let ensure = StorageOp::EnsureAccount {
                address: tx.sender_id(),
                public_key: Some(tx.sender_public_key),
            };
            accounts.track(std::slice::from_ref(&ensure))?;
            ops.push(ensure);

            let step: Vec<StorageOp> = match (&tx.tx_type, &tx.asset) {
                (TxType::Transfer, _) => {
                    let recipient = tx
                        .recipient_id
                        .ok_or(crate::transaction::TxError::MissingRecipient)?;
                    let amount = i128::try_from(tx.amount)
                        .map_err(|_| crate::transaction::TxError::AmountOverflow)?;
                    vec![
                        StorageOp::EnsureAccount {
                            address: recipient,
                            public_key: None,
                        },
                        StorageOp::MergeAccount(
                            recipient,
                            crate::account::AccountDelta {
                                balance: amount,
                                unconfirmed_balance: amount,
                                ..Default::default()
                            },
                        ),
                    ]
                }
                (TxType::DelegateRegistration, TxAsset::Delegate { username }) => {
                    vec![StorageOp::SetDelegate {
                        address: tx.sender_id(),
                        username: Some(username.clone()),
                        is_delegate: true,
                    }]
                }
                (TxType::Vote, TxAsset::Votes { added, removed }) => {
                    let voter = accounts.get(tx.sender_id())?;
                    let weight = i128::try_from(voter.balance)
                        .map_err(|_| crate::transaction::TxError::AmountOverflow)?;
                    let mut step = vec![StorageOp::SetVotes {
                        address: tx.sender_id(),
                        added: added.clone(),
                        removed: removed.clone(),
                    }];
                    for delegate in added {
                        step.push(StorageOp::MergeAccount(
                            Address::from_public_key(delegate),
                            crate::account::AccountDelta {
                                vote_weight: weight,
                                ..Default::default()
                            },
                        ));
                    }
                    step
                }
                (tx_type, asset) => {
                    return Err(ChainError::GenesisCorruption(format!(
                        "genesis transaction {tx_type:?} carries mismatched asset {asset:?}"
                    )))
                }
            };
            accounts.track(&step)?;
            ops.extend(step);
        }

        ops.extend(self.rounds.tick_forward(block, &[])?);
        self.storage.commit(&ops)?;
        info!(genesis = %block.id, "genesis block applied");
        Ok(())
    }

    /// Persist the genesis block if it is not stored yet. Idempotent.
    pub fn save_genesis_block(&self, block: &Block) -> Result<bool, ChainError> {
        if self.storage.block_exists(&block.id)? {
            return Ok(false);
        }
        self.storage
            .commit(&[StorageOp::CreateBlock(Box::new(block.clone()))])?;
        Ok(true)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn params(&self) -> &Arc<ChainParams> {
        &self.params
    }

    /// Signal shutdown and wait for any in-flight commit to finish. New
    /// units are refused once the flag is set.
    pub async fn cleanup(&self) {
        self.is_cleaning.store(true, Ordering::SeqCst);
        while self.is_processing.load(Ordering::SeqCst) {
            warn!("waiting for in-flight block commit before shutdown");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[cfg(test)]
    pub fn set_cleaning_for_tests(&self, cleaning: bool) {
        self.is_cleaning.store(cleaning, Ordering::SeqCst);
    }
}
