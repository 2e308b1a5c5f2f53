//! Peer sync: bring the local chain up to the network's height.
//!
//! Each attempt walks a fixed state machine: pick a peer, find the highest
//! block both chains share, roll the local chain back if it sits on a
//! shorter fork (backing every popped block up), then download and replay
//! the peer's blocks. Transient failures retry with capped backoff; when a
//! whole sync pass dies and left the chain shorter than the backup, the
//! backup replays with verification skipped: those blocks were verified
//! when they first applied. Peers that answer nonsense are dropped from
//! the pool.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockId};
use crate::chain::{ChainError, ChainProcessor};
use crate::network::{NetworkError, PeerClient, PeerPool};
use crate::rounds::RoundEngine;
use crate::storage::Storage;
use crate::{constants, ChainParams};

/// Errors surfaced by a failed sync pass.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no usable peers")]
    NoPeers,
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error("peer {0} misbehaved: {1}")]
    PeerMisbehaved(String, String),
}

/// Sync attempt states, for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    FetchingPeer,
    FindingCommonBlock,
    RollingBack,
    DownloadingBlocks,
    ApplyingBlocks,
    InSync,
    Retrying,
    Failed,
}

pub struct SyncLoader {
    params: Arc<ChainParams>,
    storage: Arc<dyn Storage>,
    processor: Arc<ChainProcessor>,
    rounds: Arc<RoundEngine>,
    peers: Arc<dyn PeerPool>,
    state: std::sync::Mutex<SyncState>,
}

impl SyncLoader {
    pub fn new(
        params: Arc<ChainParams>,
        storage: Arc<dyn Storage>,
        processor: Arc<ChainProcessor>,
        rounds: Arc<RoundEngine>,
        peers: Arc<dyn PeerPool>,
    ) -> Self {
        SyncLoader {
            params,
            storage,
            processor,
            rounds,
            peers,
            state: std::sync::Mutex::new(SyncState::Idle),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, state: SyncState) {
        debug!(?state, "sync state");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Run one full sync pass: retry transient failures with capped backoff
    /// until the chain is in sync with the best reachable peer, restoring
    /// the pre-sync chain from backup if the pass ultimately fails short.
    pub async fn sync(&self, token: &CancellationToken) -> Result<(), SyncError> {
        let mut backup: Vec<Block> = Vec::new();
        let mut backed_up: HashSet<u64> = HashSet::new();
        let mut retries: u32 = 0;

        let result = loop {
            if token.is_cancelled() {
                // Shutdown returns the best-known chain rather than erroring.
                break Ok(());
            }
            match self.attempt(&mut backup, &mut backed_up, token).await {
                Ok(true) => {
                    self.enter(SyncState::InSync);
                    break Ok(());
                }
                Ok(false) => {
                    // Progress was made; go straight into another attempt.
                    retries = 0;
                }
                Err(e) if retries < constants::SYNC_RETRIES => {
                    retries += 1;
                    self.enter(SyncState::Retrying);
                    let backoff = std::time::Duration::from_millis(
                        (1_000u64 << retries.min(6)).min(constants::SYNC_RETRY_CAP_MS),
                    );
                    warn!(error = %e, retry = retries, ?backoff, "sync attempt failed; backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.enter(SyncState::Failed);
                    break Err(e);
                }
            }
        };

        if result.is_err() {
            self.restore_backup(&backup).await;
        }
        result
    }

    /// One attempt against one peer. `Ok(true)` means in sync.
    async fn attempt(
        &self,
        backup: &mut Vec<Block>,
        backed_up: &mut HashSet<u64>,
        token: &CancellationToken,
    ) -> Result<bool, SyncError> {
        self.enter(SyncState::FetchingPeer);
        let our_height = self.processor.height();
        let Some((peer, peer_height)) = self.pick_peer(our_height).await? else {
            // Nobody is ahead of us.
            return Ok(true);
        };
        info!(peer = %peer.label(), peer_height, our_height, "syncing with peer");

        // Find the common ancestor, unless we are still at genesis.
        let common = if our_height > 1 {
            self.enter(SyncState::FindingCommonBlock);
            let ids = self.id_sequence()?;
            let common = match peer.get_common_block(&ids).await? {
                Some(common) => common,
                None => {
                    self.peers.remove(&peer.label());
                    return Err(SyncError::PeerMisbehaved(
                        peer.label(),
                        "no common block for our id sequence".into(),
                    ));
                }
            };
            if !self.storage.block_exists(&common.id)? {
                self.peers.remove(&peer.label());
                return Err(SyncError::PeerMisbehaved(
                    peer.label(),
                    format!("claimed common block {} we do not have", common.id),
                ));
            }
            common.id
        } else {
            self.processor.last_block().id
        };

        // On a shorter fork: roll back to the common block, backing up every
        // popped block. A block backed up once is never backed up again,
        // even across different fork branches within this pass.
        let common_height = self
            .storage
            .block_by_id(&common)?
            .map(|b| b.height)
            .unwrap_or(1);
        if peer_height > our_height && common_height < self.processor.height() {
            self.enter(SyncState::RollingBack);
            info!(
                from = self.processor.height(),
                to = common_height,
                "rolling back to common block"
            );
            while self.processor.height() > common_height {
                if token.is_cancelled() {
                    return Ok(true);
                }
                let popped = self.processor.last_block();
                self.processor.delete_last_block().await?;
                if backed_up.insert(popped.id.0) {
                    backup.push(popped);
                }
            }
        }

        // Download and replay forward from the common point.
        let mut applied_any = false;
        loop {
            if token.is_cancelled() {
                return Ok(true);
            }
            self.enter(SyncState::DownloadingBlocks);
            let from = self.processor.last_block().id;
            let blocks = peer.get_blocks(from).await?;
            if blocks.is_empty() {
                break;
            }

            self.enter(SyncState::ApplyingBlocks);
            for block in blocks {
                if token.is_cancelled() {
                    return Ok(true);
                }
                match self.processor.process_block(block, false, true, true).await {
                    Ok(()) => applied_any = true,
                    Err(ChainError::AlreadyProcessed(id)) => {
                        debug!(block = %id, "peer re-sent a processed block");
                    }
                    Err(e) => {
                        self.peers.remove(&peer.label());
                        return Err(SyncError::PeerMisbehaved(
                            peer.label(),
                            format!("sent unprocessable block: {e}"),
                        ));
                    }
                }
            }
            if self.processor.height() >= peer_height {
                break;
            }
        }

        // In sync once the peer's height is reached, or nothing applied.
        Ok(self.processor.height() >= peer_height || !applied_any)
    }

    /// Choose the first reachable peer ahead of us.
    async fn pick_peer(
        &self,
        our_height: u32,
    ) -> Result<Option<(Arc<dyn PeerClient>, u32)>, SyncError> {
        let peers = self.peers.list();
        if peers.is_empty() {
            return Err(SyncError::NoPeers);
        }
        let mut reachable = 0;
        for peer in peers {
            match peer.height().await {
                Ok(height) => {
                    reachable += 1;
                    if height > our_height {
                        return Ok(Some((peer, height)));
                    }
                }
                Err(e) => {
                    debug!(peer = %peer.label(), error = %e, "peer unreachable");
                }
            }
        }
        if reachable == 0 {
            return Err(SyncError::NoPeers);
        }
        Ok(None)
    }

    /// The id sequence offered for common-block search: the most recent
    /// block id, the first id of each of the trailing `slot_window` rounds,
    /// and the genesis id.
    fn id_sequence(&self) -> Result<Vec<BlockId>, SyncError> {
        let last = self.processor.last_block();
        let mut ids = vec![last.id];

        let current_round = self.rounds.calc_round(last.height);
        let window = self.params.slot_window as u64;
        let oldest_round = current_round.saturating_sub(window - 1).max(1);
        for round in (oldest_round..=current_round).rev() {
            let height = self.rounds.first_in_round(round);
            if let Some(block) = self.storage.block_at_height(height)? {
                ids.push(block.id);
            }
        }
        if let Some(genesis) = self.storage.block_at_height(1)? {
            ids.push(genesis.id);
        }
        ids.dedup();
        Ok(ids)
    }

    /// Disaster recovery: replay the backed-up chain, oldest first, with
    /// verification skipped: every block in it was verified when it first
    /// applied. Failures are logged, never re-thrown; the node continues at
    /// whatever height restoration reached.
    async fn restore_backup(&self, backup: &[Block]) {
        let tallest = backup.iter().map(|b| b.height).max().unwrap_or(0);
        if backup.is_empty() || tallest <= self.processor.height() {
            return;
        }
        warn!(
            backup_height = tallest,
            current_height = self.processor.height(),
            "sync failed below backup; restoring pre-sync chain"
        );
        let mut ordered: Vec<&Block> = backup.iter().collect();
        ordered.sort_by_key(|b| b.height);
        for block in ordered {
            let last = self.processor.last_block();
            if block.previous_block != Some(last.id) || block.height != last.height + 1 {
                continue;
            }
            if let Err(e) = self
                .processor
                .process_block(block.clone(), false, true, false)
                .await
            {
                warn!(block = %block.id, error = %e, "chain restore stopped");
                return;
            }
        }
        info!(height = self.processor.height(), "pre-sync chain restored");
    }
}
