//! Typed storage operations and the persistent engines that execute them.
//!
//! The chain core never mutates persistent state directly. Mutators and the
//! round engine assemble a list of [`StorageOp`] commands and hand the whole
//! unit to [`Storage::commit`], which applies every op or none of them. This
//! is the only mutation boundary in the system.
//!
//! Two engines implement the contract: [`SledStorage`] (production, a single
//! sled tree with key prefixes so multi-table units commit in one sled
//! transaction) and [`MemStorage`] (tests, copy-apply-swap under a mutex).
//!
//! Table layout: blocks keyed by height (insertion order is the height
//! order), a block-id index, a transaction-id index (PK=id, value=owning
//! block), account rows, a delegate username index, ephemeral round working
//! rows, and per-round snapshots used to unwind a finished round.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountDelta, Address};
use crate::block::{Block, BlockId};
use crate::crypto::PublicKey;
use crate::transaction::TxId;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("row not found: {0}")]
    Missing(String),
}

impl From<crate::account::MergeError> for StorageError {
    fn from(e: crate::account::MergeError) -> Self {
        StorageError::Constraint(e.to_string())
    }
}

/// One row of the ephemeral round working table. Every balance change for an
/// account that votes records one row per voted delegate; the round engine
/// sums them into vote-weight merges when the round finishes, then flushes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRow {
    pub round: u64,
    pub height: u32,
    /// Position within the owning block's row list; with `height`, forms the
    /// deterministic row key.
    pub idx: u32,
    pub block_id: BlockId,
    pub address: Address,
    pub delegate: PublicKey,
    pub amount: i128,
}

/// Everything needed to unwind one finished round: the exact deltas that
/// were applied, and the working rows that were flushed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round: u64,
    pub changes: Vec<(Address, AccountDelta)>,
    pub rows: Vec<RoundRow>,
}

/// A typed storage command. The engine executes these; it never interprets
/// chain semantics beyond row-level constraints (merge underflow).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StorageOp {
    /// Create the account row if absent; attach the public key if the row
    /// has none yet.
    EnsureAccount {
        address: Address,
        public_key: Option<PublicKey>,
    },
    /// Merge a signed delta into an account row. Fails the unit on underflow.
    MergeAccount(Address, AccountDelta),
    /// Set or clear delegate registration.
    SetDelegate {
        address: Address,
        username: Option<String>,
        is_delegate: bool,
    },
    /// Add and remove vote edges on an account.
    SetVotes {
        address: Address,
        added: Vec<PublicKey>,
        removed: Vec<PublicKey>,
    },
    /// Persist a committed block (with its transactions) and index its ids.
    CreateBlock(Box<Block>),
    /// Remove a block row, its id index entry, and its transactions' index
    /// entries.
    RemoveBlock(BlockId),
    /// Delete every block above the given height (snapshot-round truncation).
    TruncateBlocksAbove(u32),
    /// Insert one round working row.
    CreateRoundRow(RoundRow),
    /// Remove the working rows contributed by one block (block deletion
    /// within an unfinished round).
    RemoveRoundRows(BlockId),
    /// Delete all working rows of a round (round finish).
    FlushRound(u64),
    /// Persist the unwind snapshot for a finished round.
    PutRoundSnapshot(Box<RoundSnapshot>),
    /// Drop a round snapshot (round unwound, or obsolete).
    RemoveRoundSnapshot(u64),
}

/// The storage engine contract: atomic multi-table commits plus the reads
/// the chain core issues.
pub trait Storage: Send + Sync {
    /// Apply every op or none. The unit is atomic and durable on return.
    fn commit(&self, ops: &[StorageOp]) -> Result<(), StorageError>;

    fn account(&self, address: Address) -> Result<Option<Account>, StorageError>;
    fn delegate_by_username(&self, username: &str) -> Result<Option<Account>, StorageError>;
    /// All registered delegates, unordered.
    fn delegates(&self) -> Result<Vec<Account>, StorageError>;

    fn last_block(&self) -> Result<Option<Block>, StorageError>;
    fn block_by_id(&self, id: &BlockId) -> Result<Option<Block>, StorageError>;
    fn block_at_height(&self, height: u32) -> Result<Option<Block>, StorageError>;
    /// Blocks with `from <= height <= to`, ascending.
    fn blocks_in_range(&self, from: u32, to: u32) -> Result<Vec<Block>, StorageError>;
    fn block_exists(&self, id: &BlockId) -> Result<bool, StorageError>;
    /// The block a confirmed transaction belongs to, if any.
    fn tx_block(&self, id: &TxId) -> Result<Option<BlockId>, StorageError>;

    fn round_rows(&self, round: u64) -> Result<Vec<RoundRow>, StorageError>;
    fn round_snapshot(&self, round: u64) -> Result<Option<RoundSnapshot>, StorageError>;
}

// ── In-memory engine ──

#[derive(Clone, Default)]
struct Tables {
    blocks: BTreeMap<u32, Block>,
    block_ids: BTreeMap<u64, u32>,
    tx_index: BTreeMap<u64, BlockId>,
    accounts: BTreeMap<u64, Account>,
    usernames: BTreeMap<String, Address>,
    round_rows: BTreeMap<(u64, u32, u32), RoundRow>,
    round_snapshots: BTreeMap<u64, RoundSnapshot>,
}

/// Copy-apply-swap in-memory engine. Commit clones the tables, applies the
/// unit to the clone, and swaps on success, so a failed op leaves nothing
/// behind. Intended for tests and private dev networks.
#[derive(Default)]
pub struct MemStorage {
    tables: Mutex<Tables>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }
}

fn apply_op(tables: &mut Tables, op: &StorageOp) -> Result<(), StorageError> {
    match op {
        StorageOp::EnsureAccount {
            address,
            public_key,
        } => {
            let account = tables
                .accounts
                .entry(address.0)
                .or_insert_with(|| Account::new(*address));
            if account.public_key.is_none() {
                account.public_key = *public_key;
            }
        }
        StorageOp::MergeAccount(address, delta) => {
            let account = tables
                .accounts
                .entry(address.0)
                .or_insert_with(|| Account::new(*address));
            account.merge(delta)?;
        }
        StorageOp::SetDelegate {
            address,
            username,
            is_delegate,
        } => {
            let account = tables
                .accounts
                .entry(address.0)
                .or_insert_with(|| Account::new(*address));
            if let Some(old) = account.username.take() {
                tables.usernames.remove(&old);
            }
            account.username = username.clone();
            account.is_delegate = *is_delegate;
            if let Some(name) = username {
                tables.usernames.insert(name.clone(), *address);
            }
        }
        StorageOp::SetVotes {
            address,
            added,
            removed,
        } => {
            let account = tables
                .accounts
                .entry(address.0)
                .or_insert_with(|| Account::new(*address));
            account.votes.retain(|key| !removed.contains(key));
            for key in added {
                if !account.votes.contains(key) {
                    account.votes.push(*key);
                }
            }
        }
        StorageOp::CreateBlock(block) => {
            if tables.block_ids.contains_key(&block.id.0) {
                return Err(StorageError::Constraint(format!(
                    "block {} already exists",
                    block.id
                )));
            }
            for tx in &block.transactions {
                let id = tx
                    .id()
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                tables.tx_index.insert(id.0, block.id);
            }
            tables.block_ids.insert(block.id.0, block.height);
            tables.blocks.insert(block.height, (**block).clone());
        }
        StorageOp::RemoveBlock(id) => {
            let height = tables
                .block_ids
                .remove(&id.0)
                .ok_or_else(|| StorageError::Missing(format!("block {id}")))?;
            if let Some(block) = tables.blocks.remove(&height) {
                for tx in &block.transactions {
                    if let Ok(tx_id) = tx.id() {
                        tables.tx_index.remove(&tx_id.0);
                    }
                }
            }
        }
        StorageOp::TruncateBlocksAbove(height) => {
            let doomed: Vec<u32> = tables
                .blocks
                .range((height + 1)..)
                .map(|(h, _)| *h)
                .collect();
            for h in doomed {
                if let Some(block) = tables.blocks.remove(&h) {
                    tables.block_ids.remove(&block.id.0);
                    for tx in &block.transactions {
                        if let Ok(tx_id) = tx.id() {
                            tables.tx_index.remove(&tx_id.0);
                        }
                    }
                }
            }
        }
        StorageOp::CreateRoundRow(row) => {
            tables
                .round_rows
                .insert((row.round, row.height, row.idx), row.clone());
        }
        StorageOp::RemoveRoundRows(block_id) => {
            tables.round_rows.retain(|_, row| row.block_id != *block_id);
        }
        StorageOp::FlushRound(round) => {
            tables.round_rows.retain(|(r, _, _), _| r != round);
        }
        StorageOp::PutRoundSnapshot(snapshot) => {
            tables
                .round_snapshots
                .insert(snapshot.round, (**snapshot).clone());
        }
        StorageOp::RemoveRoundSnapshot(round) => {
            tables.round_snapshots.remove(round);
        }
    }
    Ok(())
}

impl Storage for MemStorage {
    fn commit(&self, ops: &[StorageOp]) -> Result<(), StorageError> {
        let mut guard = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        for op in ops {
            apply_op(&mut next, op)?;
        }
        *guard = next;
        Ok(())
    }

    fn account(&self, address: Address) -> Result<Option<Account>, StorageError> {
        Ok(self.with_tables(|t| t.accounts.get(&address.0).cloned()))
    }

    fn delegate_by_username(&self, username: &str) -> Result<Option<Account>, StorageError> {
        Ok(self.with_tables(|t| {
            t.usernames
                .get(username)
                .and_then(|addr| t.accounts.get(&addr.0))
                .cloned()
        }))
    }

    fn delegates(&self) -> Result<Vec<Account>, StorageError> {
        Ok(self.with_tables(|t| {
            t.accounts
                .values()
                .filter(|a| a.is_delegate)
                .cloned()
                .collect()
        }))
    }

    fn last_block(&self) -> Result<Option<Block>, StorageError> {
        Ok(self.with_tables(|t| t.blocks.values().next_back().cloned()))
    }

    fn block_by_id(&self, id: &BlockId) -> Result<Option<Block>, StorageError> {
        Ok(self.with_tables(|t| {
            t.block_ids
                .get(&id.0)
                .and_then(|h| t.blocks.get(h))
                .cloned()
        }))
    }

    fn block_at_height(&self, height: u32) -> Result<Option<Block>, StorageError> {
        Ok(self.with_tables(|t| t.blocks.get(&height).cloned()))
    }

    fn blocks_in_range(&self, from: u32, to: u32) -> Result<Vec<Block>, StorageError> {
        Ok(self.with_tables(|t| t.blocks.range(from..=to).map(|(_, b)| b.clone()).collect()))
    }

    fn block_exists(&self, id: &BlockId) -> Result<bool, StorageError> {
        Ok(self.with_tables(|t| t.block_ids.contains_key(&id.0)))
    }

    fn tx_block(&self, id: &TxId) -> Result<Option<BlockId>, StorageError> {
        Ok(self.with_tables(|t| t.tx_index.get(&id.0).copied()))
    }

    fn round_rows(&self, round: u64) -> Result<Vec<RoundRow>, StorageError> {
        Ok(self.with_tables(|t| {
            t.round_rows
                .range((round, 0, 0)..=(round, u32::MAX, u32::MAX))
                .map(|(_, row)| row.clone())
                .collect()
        }))
    }

    fn round_snapshot(&self, round: u64) -> Result<Option<RoundSnapshot>, StorageError> {
        Ok(self.with_tables(|t| t.round_snapshots.get(&round).cloned()))
    }
}

// ── Sled engine ──

const PFX_BLOCK: &[u8] = b"blk:";
const PFX_BLOCK_ID: &[u8] = b"bid:";
const PFX_TX: &[u8] = b"txi:";
const PFX_ACCOUNT: &[u8] = b"acc:";
const PFX_USERNAME: &[u8] = b"usr:";
const PFX_ROUND_ROW: &[u8] = b"rnd:";
const PFX_ROUND_SNAP: &[u8] = b"rsn:";

fn block_key(height: u32) -> Vec<u8> {
    [PFX_BLOCK, &height.to_be_bytes()[..]].concat()
}

fn block_id_key(id: &BlockId) -> Vec<u8> {
    [PFX_BLOCK_ID, &id.0.to_be_bytes()[..]].concat()
}

fn tx_key(id: &TxId) -> Vec<u8> {
    [PFX_TX, &id.0.to_be_bytes()[..]].concat()
}

fn account_key(address: Address) -> Vec<u8> {
    [PFX_ACCOUNT, &address.0.to_be_bytes()[..]].concat()
}

fn username_key(name: &str) -> Vec<u8> {
    [PFX_USERNAME, name.as_bytes()].concat()
}

fn round_row_key(round: u64, height: u32, idx: u32) -> Vec<u8> {
    [
        PFX_ROUND_ROW,
        &round.to_be_bytes()[..],
        &height.to_be_bytes()[..],
        &idx.to_be_bytes()[..],
    ]
    .concat()
}

fn round_snap_key(round: u64) -> Vec<u8> {
    [PFX_ROUND_SNAP, &round.to_be_bytes()[..]].concat()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    crate::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    crate::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// A pre-resolved command: every key it touches is known before the sled
/// transaction starts. Range-dependent ops (`TruncateBlocksAbove`,
/// `FlushRound`, `RemoveRoundRows`) expand to explicit key lists outside the
/// transaction; the chain core is a single writer, so the expansion cannot
/// race a concurrent commit.
enum Planned {
    Op(StorageOp),
    DeleteKeys(Vec<Vec<u8>>),
}

/// Production engine: one sled tree, key prefixes as tables, whole units in
/// one sled transaction.
pub struct SledStorage {
    #[allow(dead_code)]
    db: sled::Db,
    tree: sled::Tree,
}

impl SledStorage {
    /// Open or create the database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        let tree = db
            .open_tree("chain")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledStorage { db, tree })
    }

    /// Open a temporary database (tests).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        let tree = db
            .open_tree("chain")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledStorage { db, tree })
    }

    fn get_decoded<T: serde::de::DeserializeOwned>(
        &self,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        match self.tree.get(key).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn plan(&self, ops: &[StorageOp]) -> Result<Vec<Planned>, StorageError> {
        let mut plan = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                StorageOp::TruncateBlocksAbove(height) => {
                    let mut keys = Vec::new();
                    for entry in self.tree.range(block_key(height + 1)..=block_key(u32::MAX)) {
                        let (key, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
                        let block: Block = decode(&value)?;
                        keys.push(key.to_vec());
                        keys.push(block_id_key(&block.id));
                        for tx in &block.transactions {
                            if let Ok(tx_id) = tx.id() {
                                keys.push(tx_key(&tx_id));
                            }
                        }
                    }
                    plan.push(Planned::DeleteKeys(keys));
                }
                StorageOp::FlushRound(round) => {
                    let keys = self
                        .tree
                        .range(round_row_key(*round, 0, 0)..=round_row_key(*round, u32::MAX, u32::MAX))
                        .map(|entry| entry.map(|(k, _)| k.to_vec()))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| StorageError::Io(e.to_string()))?;
                    plan.push(Planned::DeleteKeys(keys));
                }
                StorageOp::RemoveRoundRows(block_id) => {
                    let mut keys = Vec::new();
                    for entry in self.tree.scan_prefix(PFX_ROUND_ROW) {
                        let (key, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
                        let row: RoundRow = decode(&value)?;
                        if row.block_id == *block_id {
                            keys.push(key.to_vec());
                        }
                    }
                    plan.push(Planned::DeleteKeys(keys));
                }
                other => plan.push(Planned::Op(other.clone())),
            }
        }
        Ok(plan)
    }
}

type TxTree = sled::transaction::TransactionalTree;

fn tx_get<T: serde::de::DeserializeOwned>(
    tree: &TxTree,
    key: &[u8],
) -> Result<Option<T>, StorageError> {
    match tree.get(key).map_err(|e| StorageError::Io(e.to_string()))? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn tx_put<T: Serialize>(tree: &TxTree, key: Vec<u8>, value: &T) -> Result<(), StorageError> {
    tree.insert(key, encode(value)?)
        .map_err(|e| StorageError::Io(e.to_string()))?;
    Ok(())
}

fn tx_del(tree: &TxTree, key: Vec<u8>) -> Result<(), StorageError> {
    tree.remove(key).map_err(|e| StorageError::Io(e.to_string()))?;
    Ok(())
}

fn load_account(tree: &TxTree, address: Address) -> Result<Account, StorageError> {
    Ok(tx_get::<Account>(tree, &account_key(address))?.unwrap_or_else(|| Account::new(address)))
}

fn exec_op(tree: &TxTree, op: &StorageOp) -> Result<(), StorageError> {
    match op {
        StorageOp::EnsureAccount {
            address,
            public_key,
        } => {
            let mut account = load_account(tree, *address)?;
            if account.public_key.is_none() {
                account.public_key = *public_key;
            }
            tx_put(tree, account_key(*address), &account)?;
        }
        StorageOp::MergeAccount(address, delta) => {
            let mut account = load_account(tree, *address)?;
            account.merge(delta)?;
            tx_put(tree, account_key(*address), &account)?;
        }
        StorageOp::SetDelegate {
            address,
            username,
            is_delegate,
        } => {
            let mut account = load_account(tree, *address)?;
            if let Some(old) = account.username.take() {
                tx_del(tree, username_key(&old))?;
            }
            account.username = username.clone();
            account.is_delegate = *is_delegate;
            if let Some(name) = username {
                tx_put(tree, username_key(name), address)?;
            }
            tx_put(tree, account_key(*address), &account)?;
        }
        StorageOp::SetVotes {
            address,
            added,
            removed,
        } => {
            let mut account = load_account(tree, *address)?;
            account.votes.retain(|key| !removed.contains(key));
            for key in added {
                if !account.votes.contains(key) {
                    account.votes.push(*key);
                }
            }
            tx_put(tree, account_key(*address), &account)?;
        }
        StorageOp::CreateBlock(block) => {
            if tx_get::<u32>(tree, &block_id_key(&block.id))?.is_some() {
                return Err(StorageError::Constraint(format!(
                    "block {} already exists",
                    block.id
                )));
            }
            for tx in &block.transactions {
                let id = tx
                    .id()
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                tx_put(tree, tx_key(&id), &block.id)?;
            }
            tx_put(tree, block_id_key(&block.id), &block.height)?;
            tx_put(tree, block_key(block.height), &**block)?;
        }
        StorageOp::RemoveBlock(id) => {
            let height = tx_get::<u32>(tree, &block_id_key(id))?
                .ok_or_else(|| StorageError::Missing(format!("block {id}")))?;
            if let Some(block) = tx_get::<Block>(tree, &block_key(height))? {
                for tx in &block.transactions {
                    if let Ok(tx_id) = tx.id() {
                        tx_del(tree, tx_key(&tx_id))?;
                    }
                }
            }
            tx_del(tree, block_id_key(id))?;
            tx_del(tree, block_key(height))?;
        }
        StorageOp::CreateRoundRow(row) => {
            tx_put(tree, round_row_key(row.round, row.height, row.idx), row)?;
        }
        StorageOp::PutRoundSnapshot(snapshot) => {
            tx_put(tree, round_snap_key(snapshot.round), &**snapshot)?;
        }
        StorageOp::RemoveRoundSnapshot(round) => {
            tx_del(tree, round_snap_key(*round))?;
        }
        // Range-dependent ops are expanded by `plan` before the transaction.
        StorageOp::TruncateBlocksAbove(_)
        | StorageOp::FlushRound(_)
        | StorageOp::RemoveRoundRows(_) => {
            return Err(StorageError::Constraint(
                "range op reached the transaction unplanned".into(),
            ));
        }
    }
    Ok(())
}

impl Storage for SledStorage {
    fn commit(&self, ops: &[StorageOp]) -> Result<(), StorageError> {
        use sled::transaction::{ConflictableTransactionError, TransactionError};

        let plan = self.plan(ops)?;
        let result = self.tree.transaction(|tree| {
            for step in &plan {
                match step {
                    Planned::Op(op) => {
                        exec_op(tree, op).map_err(ConflictableTransactionError::Abort)?
                    }
                    Planned::DeleteKeys(keys) => {
                        for key in keys {
                            tree.remove(key.clone()).map_err(|e| {
                                ConflictableTransactionError::Abort(StorageError::Io(
                                    e.to_string(),
                                ))
                            })?;
                        }
                    }
                }
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                self.tree
                    .flush()
                    .map_err(|e| StorageError::Io(e.to_string()))?;
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StorageError::Io(e.to_string())),
        }
    }

    fn account(&self, address: Address) -> Result<Option<Account>, StorageError> {
        self.get_decoded(&account_key(address))
    }

    fn delegate_by_username(&self, username: &str) -> Result<Option<Account>, StorageError> {
        match self.get_decoded::<Address>(&username_key(username))? {
            Some(address) => self.account(address),
            None => Ok(None),
        }
    }

    fn delegates(&self) -> Result<Vec<Account>, StorageError> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(PFX_ACCOUNT) {
            let (_, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let account: Account = decode(&value)?;
            if account.is_delegate {
                out.push(account);
            }
        }
        Ok(out)
    }

    fn last_block(&self) -> Result<Option<Block>, StorageError> {
        match self
            .tree
            .scan_prefix(PFX_BLOCK)
            .next_back()
            .transpose()
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some((_, value)) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn block_by_id(&self, id: &BlockId) -> Result<Option<Block>, StorageError> {
        match self.get_decoded::<u32>(&block_id_key(id))? {
            Some(height) => self.block_at_height(height),
            None => Ok(None),
        }
    }

    fn block_at_height(&self, height: u32) -> Result<Option<Block>, StorageError> {
        self.get_decoded(&block_key(height))
    }

    fn blocks_in_range(&self, from: u32, to: u32) -> Result<Vec<Block>, StorageError> {
        if from > to {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in self.tree.range(block_key(from)..=block_key(to)) {
            let (_, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    fn block_exists(&self, id: &BlockId) -> Result<bool, StorageError> {
        Ok(self
            .tree
            .contains_key(block_id_key(id))
            .map_err(|e| StorageError::Io(e.to_string()))?)
    }

    fn tx_block(&self, id: &TxId) -> Result<Option<BlockId>, StorageError> {
        self.get_decoded(&tx_key(id))
    }

    fn round_rows(&self, round: u64) -> Result<Vec<RoundRow>, StorageError> {
        let mut out = Vec::new();
        for entry in self
            .tree
            .range(round_row_key(round, 0, 0)..=round_row_key(round, u32::MAX, u32::MAX))
        {
            let (_, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    fn round_snapshot(&self, round: u64) -> Result<Option<RoundSnapshot>, StorageError> {
        self.get_decoded(&round_snap_key(round))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::genesis;
    use crate::ChainParams;

    fn engines() -> Vec<Box<dyn Storage>> {
        vec![
            Box::new(MemStorage::new()),
            Box::new(SledStorage::open_temporary().unwrap()),
        ]
    }

    #[test]
    fn commit_is_atomic_on_merge_underflow() {
        for store in engines() {
            let addr = Address(99);
            store
                .commit(&[
                    StorageOp::EnsureAccount {
                        address: addr,
                        public_key: None,
                    },
                    StorageOp::MergeAccount(addr, AccountDelta::balance(500)),
                ])
                .unwrap();

            // Second op underflows; the first must not survive.
            let result = store.commit(&[
                StorageOp::MergeAccount(addr, AccountDelta::balance(100)),
                StorageOp::MergeAccount(addr, AccountDelta::balance(-10_000)),
            ]);
            assert!(result.is_err());
            let account = store.account(addr).unwrap().unwrap();
            assert_eq!(account.balance, 500);
        }
    }

    #[test]
    fn block_rows_and_indexes_roundtrip() {
        for store in engines() {
            let bundle = genesis::dev_genesis(&ChainParams::default());
            let block = bundle.block.clone();
            store
                .commit(&[StorageOp::CreateBlock(Box::new(block.clone()))])
                .unwrap();

            assert!(store.block_exists(&block.id).unwrap());
            assert_eq!(store.last_block().unwrap().unwrap().id, block.id);
            assert_eq!(store.block_at_height(1).unwrap().unwrap().id, block.id);
            let tx_id = block.transactions[0].id().unwrap();
            assert_eq!(store.tx_block(&tx_id).unwrap(), Some(block.id));

            store.commit(&[StorageOp::RemoveBlock(block.id)]).unwrap();
            assert!(!store.block_exists(&block.id).unwrap());
            assert!(store.tx_block(&tx_id).unwrap().is_none());
            assert!(store.last_block().unwrap().is_none());
        }
    }

    #[test]
    fn duplicate_block_insert_is_rejected() {
        for store in engines() {
            let bundle = genesis::dev_genesis(&ChainParams::default());
            let op = StorageOp::CreateBlock(Box::new(bundle.block.clone()));
            store.commit(&[op.clone()]).unwrap();
            assert!(store.commit(&[op]).is_err());
        }
    }

    #[test]
    fn round_rows_flush_and_query() {
        for store in engines() {
            let delegate = Keypair::from_secret("row delegate").public;
            let rows: Vec<RoundRow> = (0..3)
                .map(|i| RoundRow {
                    round: 2,
                    height: 5,
                    idx: i,
                    block_id: BlockId(77),
                    address: Address(i as u64),
                    delegate,
                    amount: 100 + i as i128,
                })
                .collect();
            let ops: Vec<StorageOp> =
                rows.iter().cloned().map(StorageOp::CreateRoundRow).collect();
            store.commit(&ops).unwrap();
            assert_eq!(store.round_rows(2).unwrap(), rows);
            assert!(store.round_rows(3).unwrap().is_empty());

            store.commit(&[StorageOp::FlushRound(2)]).unwrap();
            assert!(store.round_rows(2).unwrap().is_empty());
        }
    }

    #[test]
    fn username_index_follows_delegate_updates() {
        for store in engines() {
            let addr = Address(5);
            store
                .commit(&[StorageOp::SetDelegate {
                    address: addr,
                    username: Some("lighthouse".into()),
                    is_delegate: true,
                }])
                .unwrap();
            assert_eq!(
                store
                    .delegate_by_username("lighthouse")
                    .unwrap()
                    .unwrap()
                    .address,
                addr
            );
            assert_eq!(store.delegates().unwrap().len(), 1);

            store
                .commit(&[StorageOp::SetDelegate {
                    address: addr,
                    username: None,
                    is_delegate: false,
                }])
                .unwrap();
            assert!(store.delegate_by_username("lighthouse").unwrap().is_none());
            assert!(store.delegates().unwrap().is_empty());
        }
    }
}
