//! Chain property tests: end-to-end verification of the consensus engine's
//! core invariants over the in-memory storage engine.
//!
//! Properties verified:
//! - **Apply/undo inverse law**: applying then deleting a block restores
//!   every touched account and round-state row, including across a round
//!   boundary
//! - **Fork resolution**: type-1 rolls back exactly two blocks when the
//!   incoming chain wins; type-5 replaces our block when the incoming one
//!   is older
//! - **Pool reconciliation**: overlapping pool transactions are undone,
//!   re-queued, and dropped when a block invalidates them
//! - **Sync**: a shorter fork catches up to a taller peer chain, and a
//!   failed sync restores the pre-sync chain from backup

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use meridian::account::{Account, Address};
use meridian::block::{Block, BlockId};
use meridian::chain::{ChainMutator, ChainProcessor, ReceiveOutcome};
use meridian::crypto::{Keypair, Signature};
use meridian::genesis::{self, GenesisBundle};
use meridian::mempool::Mempool;
use meridian::network::{
    CommonBlockInfo, NetworkError, NoopBroadcaster, PeerClient, PeerPool, StaticPeerPool,
};
use meridian::rounds::{RoundEngine, SlotCheck};
use meridian::storage::{MemStorage, Storage};
use meridian::sync::SyncLoader;
use meridian::transaction::{Transaction, TxAsset, TxType};
use meridian::verifier::{ChainVerifier, LogForkObserver};
use meridian::{Amount, ChainParams};

// ── Helpers ─────────────────────────────────────────────────────────────

struct TestChain {
    params: Arc<ChainParams>,
    storage: Arc<MemStorage>,
    mempool: Arc<Mempool>,
    rounds: Arc<RoundEngine>,
    mutator: Arc<ChainMutator>,
    processor: Arc<ChainProcessor>,
    bundle: GenesisBundle,
}

/// Wire a full stack over the in-memory engine with a small delegate set
/// and apply the dev genesis.
fn test_chain(active_delegates: usize) -> TestChain {
    let params = Arc::new(ChainParams {
        active_delegates,
        ..ChainParams::default()
    });
    let storage = Arc::new(MemStorage::new());
    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let mempool = Arc::new(Mempool::new(100));
    let rounds = Arc::new(RoundEngine::new(params.clone(), storage_dyn.clone()));
    let fork_observer = Arc::new(LogForkObserver);
    let verifier = Arc::new(ChainVerifier::new(params.clone(), fork_observer.clone()));
    verifier.register_extension(Box::new(SlotCheck::new(rounds.clone())));
    let mutator = Arc::new(ChainMutator::new(
        params.clone(),
        storage_dyn.clone(),
        mempool.clone(),
        rounds.clone(),
    ));

    let bundle = genesis::dev_genesis(&params);
    mutator.save_genesis_block(&bundle.block).unwrap();
    mutator.apply_genesis_block(&bundle.block).unwrap();
    verifier.on_new_block(bundle.block.id);

    let processor = Arc::new(ChainProcessor::new(
        params.clone(),
        storage_dyn,
        verifier,
        mutator.clone(),
        rounds.clone(),
        mempool.clone(),
        fork_observer,
        Arc::new(NoopBroadcaster),
        bundle.block.clone(),
    ));

    TestChain {
        params,
        storage,
        mempool,
        rounds,
        mutator,
        processor,
        bundle,
    }
}

impl TestChain {
    fn loader(&self, peers: Arc<dyn PeerPool>) -> SyncLoader {
        SyncLoader::new(
            self.params.clone(),
            self.storage.clone(),
            self.processor.clone(),
            self.rounds.clone(),
            peers,
        )
    }

    /// Build a valid next block at `timestamp`, forged by whichever
    /// delegate the round engine schedules for that slot.
    fn forge_at(&self, timestamp: u32, transactions: Vec<Transaction>) -> Block {
        let last = self.processor.last_block();
        let height = last.height + 1;
        let list = self.rounds.generate_delegate_list(height).unwrap();
        let slot = self.rounds.slot_number(timestamp) as usize;
        let scheduled = list[slot % list.len()];
        let keypair = self
            .bundle
            .delegates
            .iter()
            .find(|k| k.public == scheduled)
            .expect("scheduled delegate key")
            .clone();
        let reward = self.rounds.schedule().reward(height);
        Block::create(&last, timestamp, reward, transactions, &keypair).unwrap()
    }

    async fn apply(&self, block: Block) {
        self.processor
            .process_block(block, false, true, true)
            .await
            .unwrap();
    }

    fn account(&self, address: Address) -> Account {
        self.storage
            .account(address)
            .unwrap()
            .unwrap_or_else(|| Account::new(address))
    }
}

fn transfer(from: &Keypair, to: Address, amount: Amount, fee: Amount, timestamp: u32) -> Transaction {
    let mut tx = Transaction {
        tx_type: TxType::Transfer,
        timestamp,
        sender_public_key: from.public,
        recipient_id: Some(to),
        amount,
        fee,
        signature: Signature::empty(),
        asset: TxAsset::None,
    };
    tx.sign(from).unwrap();
    tx
}

fn address_of(kp: &Keypair) -> Address {
    Address::from_public_key(&kp.public)
}

// ── Genesis bootstrap ───────────────────────────────────────────────────

#[tokio::test]
async fn genesis_bootstrap_round_tick() {
    let chain = test_chain(3);

    // The height-1 round finishes immediately with the genesis generator
    // as its only forger: produced-block credit, no outsiders.
    let generator = chain.account(address_of(&chain.bundle.generator));
    assert_eq!(generator.produced_blocks, 1);
    for delegate in &chain.bundle.delegates {
        let account = chain.account(address_of(delegate));
        assert_eq!(account.missed_blocks, 0, "bootstrap round marked outsiders");
        assert!(account.is_delegate);
        // Treasury votes landed as direct vote-weight assignment.
        assert_eq!(account.vote_weight, chain.params.total_amount);
    }
    let treasury = chain.account(address_of(&chain.bundle.treasury));
    assert_eq!(treasury.balance, chain.params.total_amount);
    assert_eq!(treasury.unconfirmed_balance, chain.params.total_amount);
}

#[tokio::test]
async fn genesis_is_idempotent_to_save() {
    let chain = test_chain(3);
    // Saving again is a no-op, not an error.
    assert!(!chain.mutator.save_genesis_block(&chain.bundle.block).unwrap());
}

// ── Apply/undo inverse law ──────────────────────────────────────────────

#[tokio::test]
async fn apply_then_delete_restores_state() {
    let chain = test_chain(3);
    let sender = Keypair::from_secret("inverse sender");
    let recipient = Keypair::from_secret("inverse recipient");

    // Height 2: fund the sender (mid-round block).
    let funding = transfer(&chain.bundle.treasury, address_of(&sender), 10_000, 0, 19);
    chain.apply(chain.forge_at(20, vec![funding])).await;

    let watched: Vec<Address> = chain
        .bundle
        .delegates
        .iter()
        .map(address_of)
        .chain([
            address_of(&sender),
            address_of(&recipient),
            address_of(&chain.bundle.treasury),
        ])
        .collect();

    // Height 3 closes the round (3 delegates): the boundary case.
    let spend = transfer(&sender, address_of(&recipient), 600, 10, 29);
    let before: Vec<Account> = watched.iter().map(|a| chain.account(*a)).collect();
    let rows_before = chain.storage.round_rows(1).unwrap();

    let boundary_block = chain.forge_at(30, vec![spend]);
    chain.apply(boundary_block.clone()).await;

    // The boundary actually distributed: fees moved, the pool row table
    // flushed.
    assert!(chain.storage.round_rows(1).unwrap().is_empty());
    let after_apply: Vec<Account> = watched.iter().map(|a| chain.account(*a)).collect();
    assert_ne!(before, after_apply);

    let restored_head = chain.processor.delete_last_block().await.unwrap();
    assert_eq!(restored_head.height, 2);

    let after_delete: Vec<Account> = watched.iter().map(|a| chain.account(*a)).collect();
    assert_eq!(before, after_delete, "accounts not restored exactly");
    assert_eq!(
        rows_before,
        chain.storage.round_rows(1).unwrap(),
        "round working rows not restored exactly"
    );
    assert!(chain
        .storage
        .block_by_id(&boundary_block.id)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn apply_then_delete_mid_round() {
    let chain = test_chain(3);
    let sender = Keypair::from_secret("mid sender");

    let watched = [
        address_of(&chain.bundle.treasury),
        address_of(&sender),
        address_of(&chain.bundle.generator),
    ];
    let before: Vec<Account> = watched.iter().map(|a| chain.account(*a)).collect();

    let funding = transfer(&chain.bundle.treasury, address_of(&sender), 5_000, 25, 19);
    chain.apply(chain.forge_at(20, vec![funding])).await;
    chain.processor.delete_last_block().await.unwrap();

    let after: Vec<Account> = watched.iter().map(|a| chain.account(*a)).collect();
    assert_eq!(before, after);
    assert_eq!(chain.processor.height(), 1);
}

#[tokio::test]
async fn genesis_cannot_be_deleted() {
    let chain = test_chain(3);
    assert!(chain.processor.delete_last_block().await.is_err());
}

// ── Round economics ─────────────────────────────────────────────────────

#[tokio::test]
async fn full_round_distributes_fees_exactly() {
    let chain = test_chain(3);
    let sender = Keypair::from_secret("fee round sender");

    // Two fee-bearing blocks close round 1 (genesis occupied height 1).
    let funding = transfer(&chain.bundle.treasury, address_of(&sender), 100_000, 7, 19);
    chain.apply(chain.forge_at(20, vec![funding])).await;
    let spend = transfer(&sender, address_of(&chain.bundle.treasury), 50, 10, 29);
    chain.apply(chain.forge_at(30, vec![spend])).await;

    // Round 1 spans genesis plus these two blocks, so the genesis
    // generator holds a forged position as well.
    let total_fees: Amount = 17;
    let distributed: Amount = chain
        .bundle
        .delegates
        .iter()
        .chain([&chain.bundle.generator])
        .map(|d| chain.account(address_of(d)).fees)
        .sum();
    assert_eq!(distributed, total_fees, "fees created or destroyed");
}

// ── Fork resolution ─────────────────────────────────────────────────────

#[tokio::test]
async fn fork_one_rolls_back_two_blocks_when_incoming_wins() {
    let ours = test_chain(3);
    let theirs = test_chain(3);

    // Our chain forged late; the competing chain forged the same heights
    // earlier.
    ours.apply(ours.forge_at(40, vec![])).await;
    ours.apply(ours.forge_at(50, vec![])).await;
    theirs.apply(theirs.forge_at(10, vec![])).await;
    theirs.apply(theirs.forge_at(20, vec![])).await;
    let incoming = theirs.forge_at(30, vec![]);
    theirs.apply(incoming.clone()).await;

    // Height 4, parent differs from our block 3, and it is older: the
    // incoming chain wins; exactly two blocks roll back.
    assert_eq!(ours.processor.height(), 3);
    let outcome = ours.processor.on_receive_block(incoming).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::ForkOneRolledBack);
    assert_eq!(ours.processor.height(), 1);
}

#[tokio::test]
async fn fork_one_keeps_our_chain_when_we_win() {
    let ours = test_chain(3);
    let theirs = test_chain(3);

    ours.apply(ours.forge_at(10, vec![])).await;
    ours.apply(ours.forge_at(20, vec![])).await;
    theirs.apply(theirs.forge_at(40, vec![])).await;
    theirs.apply(theirs.forge_at(50, vec![])).await;
    let incoming = theirs.forge_at(60, vec![]);
    theirs.apply(incoming.clone()).await;

    let outcome = ours.processor.on_receive_block(incoming).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::Discarded);
    assert_eq!(ours.processor.height(), 3);
}

#[tokio::test]
async fn fork_five_replaces_our_block_with_older() {
    let ours = test_chain(3);
    let theirs = test_chain(3);

    ours.apply(ours.forge_at(20, vec![])).await;
    let incoming = theirs.forge_at(10, vec![]);
    theirs.apply(incoming.clone()).await;
    assert_ne!(incoming.id, ours.processor.last_block().id);

    let outcome = ours.processor.on_receive_block(incoming.clone()).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::ForkFiveReplaced);
    assert_eq!(ours.processor.last_block().id, incoming.id);
    assert_eq!(ours.processor.height(), 2);
}

#[tokio::test]
async fn unattached_block_is_discarded() {
    let ours = test_chain(3);
    let theirs = test_chain(3);
    theirs.apply(theirs.forge_at(10, vec![])).await;
    theirs.apply(theirs.forge_at(20, vec![])).await;
    let stray = theirs.forge_at(30, vec![]);
    theirs.apply(stray.clone()).await;

    // Height 4 against our height 1: does not attach anywhere.
    let outcome = ours.processor.on_receive_block(stray).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::Discarded);
    assert_eq!(ours.processor.height(), 1);
}

#[tokio::test]
async fn in_order_block_applies_and_repeat_is_known() {
    let chain = test_chain(3);
    let block = chain.forge_at(10, vec![]);
    let outcome = chain.processor.on_receive_block(block.clone()).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::Applied);
    let outcome = chain.processor.on_receive_block(block).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::AlreadyKnown);
}

#[tokio::test]
async fn wrong_slot_generator_is_rejected() {
    let chain = test_chain(3);
    let last = chain.processor.last_block();

    // Forge with a delegate that is NOT scheduled for slot 1.
    let list = chain.rounds.generate_delegate_list(2).unwrap();
    let scheduled = list[1 % list.len()];
    let wrong = chain
        .bundle
        .delegates
        .iter()
        .find(|k| k.public != scheduled)
        .unwrap();
    let block = Block::create(&last, 10, 0, vec![], wrong).unwrap();

    let err = chain
        .processor
        .process_block(block, false, true, true)
        .await
        .unwrap_err();
    let message = format!("{err}");
    assert!(message.contains("Failed to verify slot"), "{message}");
}

// ── Pool reconciliation ─────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_pool_transaction_dropped_when_invalidated() {
    let chain = test_chain(3);
    let sender = Keypair::from_secret("overlap sender");
    let funding = transfer(&chain.bundle.treasury, address_of(&sender), 1_000, 0, 19);
    chain.apply(chain.forge_at(20, vec![funding])).await;

    // Pool transaction provisionally spends 610 of the sender's 1000.
    let pooled = transfer(&sender, Address(42), 600, 10, 21);
    let pooled_id = chain.mempool.add(pooled.clone()).unwrap();
    chain
        .mempool
        .try_apply_unconfirmed(&pooled, chain.storage.as_ref())
        .unwrap();
    chain.mempool.mark_applied_unconfirmed(&pooled_id, true);
    assert_eq!(
        chain.account(address_of(&sender)).unconfirmed_balance,
        390
    );

    // A block confirms a different spend of 510 from the same sender; the
    // pooled transaction no longer fits and must be dropped.
    let conflicting = transfer(&sender, Address(43), 500, 10, 29);
    chain.apply(chain.forge_at(30, vec![conflicting])).await;

    assert!(!chain.mempool.contains(&pooled_id));
    let account = chain.account(address_of(&sender));
    assert_eq!(account.balance, 490);
    assert_eq!(account.unconfirmed_balance, 490);
}

#[tokio::test]
async fn overlapping_pool_transaction_requeued_when_still_valid() {
    let chain = test_chain(3);
    let sender = Keypair::from_secret("requeue sender");
    let funding = transfer(&chain.bundle.treasury, address_of(&sender), 1_000, 0, 19);
    chain.apply(chain.forge_at(20, vec![funding])).await;

    let pooled = transfer(&sender, Address(42), 100, 10, 21);
    let pooled_id = chain.mempool.add(pooled.clone()).unwrap();
    chain
        .mempool
        .try_apply_unconfirmed(&pooled, chain.storage.as_ref())
        .unwrap();
    chain.mempool.mark_applied_unconfirmed(&pooled_id, true);

    let other = transfer(&sender, Address(43), 200, 10, 29);
    chain.apply(chain.forge_at(30, vec![other])).await;

    // Still affordable: re-queued, still provisionally applied.
    assert!(chain.mempool.contains(&pooled_id));
    assert!(chain.mempool.is_applied_unconfirmed(&pooled_id));
    let account = chain.account(address_of(&sender));
    assert_eq!(account.balance, 790);
    // 790 confirmed minus the re-applied provisional 110.
    assert_eq!(account.unconfirmed_balance, 680);
}

// ── Sync ────────────────────────────────────────────────────────────────

struct MockPeer {
    label: String,
    chain: Vec<Block>,
}

#[async_trait::async_trait]
impl PeerClient for MockPeer {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn height(&self) -> Result<u32, NetworkError> {
        Ok(self.chain.last().map(|b| b.height).unwrap_or(0))
    }

    async fn get_common_block(
        &self,
        ids: &[BlockId],
    ) -> Result<Option<CommonBlockInfo>, NetworkError> {
        for id in ids {
            if let Some(block) = self.chain.iter().find(|b| b.id == *id) {
                return Ok(Some(CommonBlockInfo {
                    id: block.id,
                    previous_block: block.previous_block,
                    height: block.height,
                }));
            }
        }
        Ok(None)
    }

    async fn get_blocks(&self, last_block_id: BlockId) -> Result<Vec<Block>, NetworkError> {
        let Some(pos) = self.chain.iter().position(|b| b.id == last_block_id) else {
            return Ok(vec![]);
        };
        Ok(self.chain[pos + 1..].to_vec())
    }

    async fn post_block(&self, _block: &Block) -> Result<bool, NetworkError> {
        Ok(true)
    }
}

/// Peer that advertises a tall chain but cannot deliver blocks.
struct BrokenPeer {
    genesis: Block,
}

#[async_trait::async_trait]
impl PeerClient for BrokenPeer {
    fn label(&self) -> String {
        "broken".into()
    }

    async fn height(&self) -> Result<u32, NetworkError> {
        Ok(100)
    }

    async fn get_common_block(
        &self,
        _ids: &[BlockId],
    ) -> Result<Option<CommonBlockInfo>, NetworkError> {
        Ok(Some(CommonBlockInfo {
            id: self.genesis.id,
            previous_block: None,
            height: 1,
        }))
    }

    async fn get_blocks(&self, _last_block_id: BlockId) -> Result<Vec<Block>, NetworkError> {
        Err(NetworkError::PeerUnreachable("broken".into()))
    }

    async fn post_block(&self, _block: &Block) -> Result<bool, NetworkError> {
        Ok(true)
    }
}

#[tokio::test]
async fn sync_replaces_shorter_fork_with_peer_chain() {
    let local = test_chain(3);
    let remote = test_chain(3);

    // Local forged two late blocks; the network's chain is taller and
    // earlier.
    local.apply(local.forge_at(40, vec![])).await;
    local.apply(local.forge_at(50, vec![])).await;
    for ts in [10, 20, 30, 130] {
        remote.apply(remote.forge_at(ts, vec![])).await;
    }
    assert_eq!(remote.processor.height(), 5);

    let peer_chain = remote.storage.blocks_in_range(1, 5).unwrap();
    let peer: Arc<dyn PeerClient> = Arc::new(MockPeer {
        label: "remote".into(),
        chain: peer_chain.clone(),
    });
    let loader = local.loader(Arc::new(StaticPeerPool::new(vec![peer])));

    loader.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(local.processor.height(), 5);
    assert_eq!(local.processor.last_block().id, peer_chain[4].id);
}

#[tokio::test]
async fn sync_noop_when_already_best() {
    let local = test_chain(3);
    local.apply(local.forge_at(10, vec![])).await;
    let own_chain = local.storage.blocks_in_range(1, 2).unwrap();

    let peer: Arc<dyn PeerClient> = Arc::new(MockPeer {
        label: "equal".into(),
        chain: own_chain,
    });
    let loader = local.loader(Arc::new(StaticPeerPool::new(vec![peer])));
    loader.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(local.processor.height(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_sync_restores_backed_up_chain() {
    let local = test_chain(3);
    local.apply(local.forge_at(10, vec![])).await;
    local.apply(local.forge_at(20, vec![])).await;
    let head_before = local.processor.last_block();

    let peer: Arc<dyn PeerClient> = Arc::new(BrokenPeer {
        genesis: local.bundle.block.clone(),
    });
    let loader = local.loader(Arc::new(StaticPeerPool::new(vec![peer])));

    // The peer claims height 100 with only genesis in common: we roll back
    // to genesis, every download fails, retries exhaust, and the backup
    // replays the original chain.
    let result = loader.sync(&CancellationToken::new()).await;
    assert!(result.is_err());
    assert_eq!(local.processor.height(), 3);
    assert_eq!(local.processor.last_block().id, head_before.id);
}
