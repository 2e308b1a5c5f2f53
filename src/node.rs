//! Node wiring: owns every subsystem, bootstraps the chain, and runs the
//! forging loop.
//!
//! Construction wires the verifier, round engine, mutator, processor, and
//! sync loader together through constructor injection, saves and applies
//! the genesis block on first start, and reseeds the verifier's
//! recently-seen window from the stored chain tail. `run` ticks once per
//! slot and forges whenever one of the configured delegate keys is
//! scheduled.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainError, ChainMutator, ChainProcessor};
use crate::config::MeridianConfig;
use crate::crypto::Keypair;
use crate::genesis;
use crate::mempool::Mempool;
use crate::network::{Broadcaster, PeerPool};
use crate::rounds::{RoundEngine, SlotCheck};
use crate::storage::Storage;
use crate::sync::SyncLoader;
use crate::verifier::{ChainVerifier, LogForkObserver};
use crate::{constants, ChainParams};

pub struct Node {
    params: Arc<ChainParams>,
    storage: Arc<dyn Storage>,
    mempool: Arc<Mempool>,
    rounds: Arc<RoundEngine>,
    mutator: Arc<ChainMutator>,
    processor: Arc<ChainProcessor>,
    sync: Arc<SyncLoader>,
    forging_keys: Vec<Keypair>,
}

impl Node {
    /// Wire all subsystems and bootstrap the chain. A genesis failure is
    /// fatal: the caller must abort the process.
    pub fn new(
        config: &MeridianConfig,
        params: ChainParams,
        storage: Arc<dyn Storage>,
        peers: Arc<dyn PeerPool>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, ChainError> {
        let params = Arc::new(params);
        let mempool = Arc::new(Mempool::new(constants::POOL_MAX_TXS));
        let rounds = Arc::new(RoundEngine::new(params.clone(), storage.clone()));
        let fork_observer = Arc::new(LogForkObserver);
        let verifier = Arc::new(ChainVerifier::new(params.clone(), fork_observer.clone()));
        verifier.register_extension(Box::new(SlotCheck::new(rounds.clone())));
        let mutator = Arc::new(ChainMutator::new(
            params.clone(),
            storage.clone(),
            mempool.clone(),
            rounds.clone(),
        ));

        let last_block = match storage.last_block()? {
            Some(block) => {
                info!(height = block.height, id = %block.id, "resuming stored chain");
                block
            }
            None => {
                let bundle = genesis::dev_genesis(&params);
                mutator.save_genesis_block(&bundle.block)?;
                mutator.apply_genesis_block(&bundle.block)?;
                info!(id = %bundle.block.id, "chain bootstrapped from genesis");
                bundle.block
            }
        };

        // Reseed the recently-seen id window from the chain tail.
        let from = last_block
            .height
            .saturating_sub(params.slot_window as u32 - 1)
            .max(1);
        for block in storage.blocks_in_range(from, last_block.height)? {
            verifier.on_new_block(block.id);
        }

        let processor = Arc::new(ChainProcessor::new(
            params.clone(),
            storage.clone(),
            verifier,
            mutator.clone(),
            rounds.clone(),
            mempool.clone(),
            fork_observer,
            broadcaster,
            last_block,
        ));
        let sync = Arc::new(SyncLoader::new(
            params.clone(),
            storage.clone(),
            processor.clone(),
            rounds.clone(),
            peers,
        ));

        let forging_keys: Vec<Keypair> = config
            .forging
            .secrets
            .iter()
            .map(|secret| Keypair::from_secret(secret))
            .collect();
        for key in &forging_keys {
            info!(delegate = %key.public.to_hex(), "forging enabled");
        }

        Ok(Node {
            params,
            storage,
            mempool,
            rounds,
            mutator,
            processor,
            sync,
            forging_keys,
        })
    }

    pub fn processor(&self) -> &Arc<ChainProcessor> {
        &self.processor
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn sync_loader(&self) -> &Arc<SyncLoader> {
        &self.sync
    }

    /// Seconds since the genesis epoch, clamped at zero before it.
    pub fn epoch_timestamp(&self) -> u32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now.saturating_sub(self.params.genesis_epoch_unix) as u32
    }

    /// Main loop: sync once at startup, then tick slots and forge when one
    /// of our delegates is scheduled. Returns after shutdown is signalled
    /// and the in-flight unit (if any) has finished.
    pub async fn run(&self, token: CancellationToken) {
        if let Err(e) = self.sync.sync(&token).await {
            warn!(error = %e, "initial sync did not complete");
        }

        let mut last_slot = u32::MAX;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
            }
            let slot = self.rounds.slot_number(self.epoch_timestamp());
            if slot == last_slot {
                continue;
            }
            last_slot = slot;
            self.maybe_forge(slot).await;
        }

        self.mutator.cleanup().await;
        info!("node stopped");
    }

    async fn maybe_forge(&self, slot: u32) {
        if self.forging_keys.is_empty() {
            return;
        }
        let next_height = self.processor.height() + 1;
        let list = match self.rounds.generate_delegate_list(next_height) {
            Ok(list) if !list.is_empty() => list,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "cannot derive forging order");
                return;
            }
        };
        let scheduled = &list[slot as usize % list.len()];
        let Some(keypair) = self.forging_keys.iter().find(|k| k.public == *scheduled) else {
            return;
        };

        match self
            .processor
            .generate_block(keypair, self.rounds.slot_time(slot))
            .await
        {
            Ok(block) => {
                info!(block = %block.id, height = block.height, slot, "forged and applied block");
            }
            Err(e) => {
                error!(error = %e, slot, "forging failed");
            }
        }
    }
}
