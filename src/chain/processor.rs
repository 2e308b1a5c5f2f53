//! Block processing orchestration: verification, fork resolution, and local
//! block generation.
//!
//! All chain writes funnel through one async writer lock; peer-received
//! blocks, sync replay, and local forging serialize here. Reads of the last
//! block are lock-free behind a shared pointer updated only inside the
//! write path.
//!
//! Fork policy: a competing block at our height + 1 whose parent is not our
//! last block is a type-1 fork: if the incoming block is older (lower
//! timestamp, ties by lower id), our two newest blocks roll back and sync
//! refetches the winning chain. A block at our height with our parent but a
//! different id is a type-5 double-forge; the older block wins, replacing
//! ours when we lose.

use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::block::Block;
use crate::chain::{ChainError, ChainMutator};
use crate::mempool::Mempool;
use crate::network::Broadcaster;
use crate::rounds::RoundEngine;
use crate::storage::Storage;
use crate::transaction::handler_for;
use crate::verifier::{ChainVerifier, ForkObserver, ForkType};
use crate::ChainParams;

/// What happened to a received block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Verified and applied in order.
    Applied,
    /// Type-1 fork, incoming chain wins: two local blocks rolled back,
    /// sync will refetch.
    ForkOneRolledBack,
    /// Type-5 double-forge, incoming block wins: ours deleted, incoming
    /// applied.
    ForkFiveReplaced,
    /// Our block wins the tie-break, or the block does not attach; dropped.
    Discarded,
    /// Same id as the current last block.
    AlreadyKnown,
}

pub struct ChainProcessor {
    params: Arc<ChainParams>,
    storage: Arc<dyn Storage>,
    verifier: Arc<ChainVerifier>,
    mutator: Arc<ChainMutator>,
    rounds: Arc<RoundEngine>,
    mempool: Arc<Mempool>,
    fork_observer: Arc<dyn ForkObserver>,
    broadcaster: Arc<dyn Broadcaster>,
    last_block: RwLock<Block>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ChainProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: Arc<ChainParams>,
        storage: Arc<dyn Storage>,
        verifier: Arc<ChainVerifier>,
        mutator: Arc<ChainMutator>,
        rounds: Arc<RoundEngine>,
        mempool: Arc<Mempool>,
        fork_observer: Arc<dyn ForkObserver>,
        broadcaster: Arc<dyn Broadcaster>,
        last_block: Block,
    ) -> Self {
        ChainProcessor {
            params,
            storage,
            verifier,
            mutator,
            rounds,
            mempool,
            fork_observer,
            broadcaster,
            last_block: RwLock::new(last_block),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The current chain head. Lock-free for readers; updated only inside
    /// the write path.
    pub fn last_block(&self) -> Block {
        self.last_block
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_last_block(&self, block: Block) {
        *self.last_block.write().unwrap_or_else(|e| e.into_inner()) = block;
    }

    pub fn height(&self) -> u32 {
        self.last_block
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .height
    }

    /// Verify and apply one block under the writer lock.
    pub async fn process_block(
        &self,
        block: Block,
        broadcast: bool,
        save: bool,
        verify: bool,
    ) -> Result<(), ChainError> {
        let _guard = self.write_lock.lock().await;
        self.process_block_locked(block, broadcast, save, verify)
    }

    fn process_block_locked(
        &self,
        block: Block,
        broadcast: bool,
        save: bool,
        verify: bool,
    ) -> Result<(), ChainError> {
        let last = self.last_block();

        if verify {
            let result = self.verifier.verify_block(&block, &last);
            if !result.verified {
                return Err(ChainError::Verification(result.errors));
            }
        }
        if broadcast {
            self.broadcaster.broadcast_block(&block);
        }
        if self.storage.block_exists(&block.id)? {
            return Err(ChainError::AlreadyProcessed(block.id));
        }
        if verify {
            self.check_transactions(&block)?;
        }

        self.mutator.apply_block(&block, save)?;
        self.verifier.on_new_block(block.id);
        self.set_last_block(block);
        Ok(())
    }

    /// Per-transaction admission checks: not yet confirmed, signature
    /// valid, business rules pass against current state.
    fn check_transactions(&self, block: &Block) -> Result<(), ChainError> {
        for tx in &block.transactions {
            let id = tx.id()?;
            if self.storage.tx_block(&id)?.is_some() {
                return Err(ChainError::TxAlreadyConfirmed(id));
            }
            if !tx.verify_signature()? {
                return Err(ChainError::Tx(
                    crate::transaction::TxError::InvalidSignature,
                ));
            }
            let sender = self
                .storage
                .account(tx.sender_id())?
                .unwrap_or_else(|| crate::account::Account::new(tx.sender_id()));
            handler_for(tx.tx_type).verify(tx, &sender, self.storage.as_ref())?;
        }
        Ok(())
    }

    /// Handle a block received from a peer or generated elsewhere.
    pub async fn on_receive_block(&self, block: Block) -> Result<ReceiveOutcome, ChainError> {
        let _guard = self.write_lock.lock().await;
        let last = self.last_block();

        if block.previous_block == Some(last.id) && block.height == last.height + 1 {
            debug!(block = %block.id, height = block.height, "received in-order block");
            self.process_block_locked(block, true, true, true)?;
            return Ok(ReceiveOutcome::Applied);
        }

        if block.previous_block != Some(last.id) && block.height == last.height + 1 {
            return self.receive_fork_one(block, last);
        }

        if block.previous_block == last.previous_block
            && block.height == last.height
            && block.id != last.id
        {
            return self.receive_fork_five(block, last);
        }

        if block.id == last.id {
            debug!(block = %block.id, "block already processed");
            return Ok(ReceiveOutcome::AlreadyKnown);
        }

        warn!(
            block = %block.id,
            height = block.height,
            our_height = last.height,
            "discarding block that does not attach"
        );
        Ok(ReceiveOutcome::Discarded)
    }

    /// Type-1 fork: competing continuation of a different parent.
    fn receive_fork_one(&self, block: Block, last: Block) -> Result<ReceiveOutcome, ChainError> {
        self.fork_observer.fork(&block, ForkType::Type1);

        if incoming_loses(&block, &last) {
            info!(block = %block.id, "fork 1: our chain wins the tie-break");
            return Ok(ReceiveOutcome::Discarded);
        }

        // The incoming chain wins. Sanity-check the candidate before
        // rolling anything back.
        let result = self.verifier.verify_receipt(&block, &last);
        if !result.verified {
            return Err(ChainError::Verification(result.errors));
        }

        info!(block = %block.id, "fork 1: rolling back two blocks");
        let after_first = self.mutator.delete_last_block()?;
        self.set_last_block(after_first);
        let after_second = self.mutator.delete_last_block()?;
        self.set_last_block(after_second);
        Ok(ReceiveOutcome::ForkOneRolledBack)
    }

    /// Type-5 fork: the same parent forged twice.
    fn receive_fork_five(&self, block: Block, last: Block) -> Result<ReceiveOutcome, ChainError> {
        self.fork_observer.fork(&block, ForkType::Type5);

        if block.generator_public_key == last.generator_public_key {
            warn!(
                generator = %block.generator_public_key.to_hex(),
                "fork 5: delegate double-forged"
            );
        }
        if incoming_loses(&block, &last) {
            info!(block = %block.id, "fork 5: our block wins the tie-break");
            return Ok(ReceiveOutcome::Discarded);
        }

        info!(block = %block.id, "fork 5: replacing our last block");
        let previous = self.mutator.delete_last_block()?;
        self.set_last_block(previous);
        self.process_block_locked(block, true, true, true)?;
        Ok(ReceiveOutcome::ForkFiveReplaced)
    }

    /// Delete the last block under the writer lock, keeping the shared head
    /// pointer consistent. Returns the new last block.
    pub async fn delete_last_block(&self) -> Result<Block, ChainError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.mutator.delete_last_block()?;
        self.set_last_block(previous.clone());
        Ok(previous)
    }

    /// Forge a block from the pending pool on top of the current chain.
    pub async fn generate_block(
        &self,
        keypair: &crate::crypto::Keypair,
        timestamp: u32,
    ) -> Result<Block, ChainError> {
        let _guard = self.write_lock.lock().await;
        let last = self.last_block();

        let candidates = self.mempool.ready(
            self.params.max_txs_per_block,
            self.params.max_payload_length as usize,
        );
        let mut included = Vec::with_capacity(candidates.len());
        for tx in candidates {
            let sender = self
                .storage
                .account(tx.sender_id())?
                .unwrap_or_else(|| crate::account::Account::new(tx.sender_id()));
            match handler_for(tx.tx_type).verify(&tx, &sender, self.storage.as_ref()) {
                Ok(()) => included.push(tx),
                Err(e) => debug!(error = %e, "excluding pool transaction from forged block"),
            }
        }

        let reward = self.rounds.schedule().reward(last.height + 1);
        let block = Block::create(&last, timestamp, reward, included, keypair)?;
        info!(
            block = %block.id,
            height = block.height,
            transactions = block.transactions.len(),
            "forged block"
        );
        self.process_block_locked(block.clone(), true, true, true)?;
        Ok(block)
    }
}

/// Tie-break shared by both fork types: the earlier block wins; on equal
/// timestamps the lower id wins. Returns true when the incoming block
/// loses to ours.
fn incoming_loses(incoming: &Block, ours: &Block) -> bool {
    incoming.timestamp > ours.timestamp
        || (incoming.timestamp == ours.timestamp && incoming.id.0 > ours.id.0)
}
