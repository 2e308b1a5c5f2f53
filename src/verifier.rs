//! Candidate block verification.
//!
//! Two entry points share most checks: [`ChainVerifier::verify_receipt`]
//! runs before fork detection against a tentative height of
//! `lastBlock.height + 1` and additionally rejects recently-seen block ids;
//! [`ChainVerifier::verify_block`] runs the full pipeline and records a
//! type-1 fork when the candidate continues a different chain. Failures are
//! collected, not short-circuited, so one pass reports every defect; the
//! collected list is reversed before returning (deterministic, historical
//! order). Other subsystems hook extra checks in through
//! [`VerifyExtension`] without this module knowing about them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::block::{Block, BlockId};
use crate::crypto::sha256;
use crate::rewards::RewardSchedule;
use crate::transaction::TxId;
use crate::ChainParams;

/// Outcome of a verification pass.
#[derive(Clone, Debug)]
pub struct VerifyResult {
    pub verified: bool,
    pub errors: Vec<String>,
}

/// A check appended by another subsystem (e.g. the round engine's
/// slot-timing check). Runs after the built-in checks on both entry points.
pub trait VerifyExtension: Send + Sync {
    fn inspect(&self, block: &Block, result: &mut VerifyResult);
}

/// Fork classification reported to the fork-accounting observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkType {
    /// Same height, different previous block: a competing chain.
    Type1,
    /// Same height and previous block, different id: simultaneous forging.
    Type5,
}

/// Fire-and-forget fork accounting.
pub trait ForkObserver: Send + Sync {
    fn fork(&self, block: &Block, fork_type: ForkType);
}

/// Observer that only logs.
pub struct LogForkObserver;

impl ForkObserver for LogForkObserver {
    fn fork(&self, block: &Block, fork_type: ForkType) {
        debug!(block = %block.id, height = block.height, ?fork_type, "fork observed");
    }
}

pub struct ChainVerifier {
    params: Arc<ChainParams>,
    schedule: RewardSchedule,
    fork_observer: Arc<dyn ForkObserver>,
    last_ids: Mutex<VecDeque<BlockId>>,
    extensions: RwLock<Vec<Box<dyn VerifyExtension>>>,
}

impl ChainVerifier {
    pub fn new(params: Arc<ChainParams>, fork_observer: Arc<dyn ForkObserver>) -> Self {
        let schedule = RewardSchedule::from_params(&params);
        ChainVerifier {
            params,
            schedule,
            fork_observer,
            last_ids: Mutex::new(VecDeque::new()),
            extensions: RwLock::new(Vec::new()),
        }
    }

    /// Register an external check. Wiring-time only.
    pub fn register_extension(&self, extension: Box<dyn VerifyExtension>) {
        self.extensions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(extension);
    }

    /// Record a committed block id in the bounded recently-seen window.
    pub fn on_new_block(&self, id: BlockId) {
        let mut ids = self.last_ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.push_back(id);
        while ids.len() > self.params.slot_window {
            ids.pop_front();
        }
    }

    /// Pre-fork-detection checks against a tentative height of
    /// `last_block.height + 1`.
    pub fn verify_receipt(&self, block: &Block, last_block: &Block) -> VerifyResult {
        let mut errors = Vec::new();
        let tentative_height = last_block.height + 1;

        self.check_signature(block, &mut errors);
        self.check_previous_presence(block, tentative_height, &mut errors);
        self.check_against_last_ids(block, &mut errors);
        self.check_version(block, &mut errors);
        self.check_reward(block, tentative_height, &mut errors);
        self.check_id(block, &mut errors);
        self.check_payload(block, &mut errors);

        self.finish(block, errors)
    }

    /// Full verification of a block about to be processed, including
    /// type-1 fork detection against the current last block.
    pub fn verify_block(&self, block: &Block, last_block: &Block) -> VerifyResult {
        let mut errors = Vec::new();
        let tentative_height = last_block.height + 1;

        self.check_signature(block, &mut errors);
        self.check_previous_presence(block, tentative_height, &mut errors);
        self.check_version(block, &mut errors);
        self.check_reward(block, tentative_height, &mut errors);
        self.check_id(block, &mut errors);
        self.check_payload(block, &mut errors);
        self.check_fork_one(block, last_block, &mut errors);

        self.finish(block, errors)
    }

    fn finish(&self, block: &Block, errors: Vec<String>) -> VerifyResult {
        let mut result = VerifyResult {
            verified: errors.is_empty(),
            errors,
        };
        for extension in self
            .extensions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            extension.inspect(block, &mut result);
        }
        result.errors.reverse();
        result.verified = result.errors.is_empty();
        result
    }

    fn check_signature(&self, block: &Block, errors: &mut Vec<String>) {
        match block.verify_signature() {
            Ok(true) => {}
            Ok(false) => errors.push("Failed to verify block signature".into()),
            Err(e) => errors.push(format!("Failed to verify block signature: {e}")),
        }
    }

    fn check_previous_presence(&self, block: &Block, tentative_height: u32, errors: &mut Vec<String>) {
        if block.previous_block.is_none() && tentative_height != 1 {
            errors.push("Invalid previous block".into());
        }
    }

    fn check_against_last_ids(&self, block: &Block, errors: &mut Vec<String>) {
        let ids = self.last_ids.lock().unwrap_or_else(|e| e.into_inner());
        if ids.contains(&block.id) {
            errors.push(format!("Block {} already exists", block.id));
        }
    }

    fn check_version(&self, block: &Block, errors: &mut Vec<String>) {
        if block.version != 0 {
            errors.push("Invalid block version".into());
        }
    }

    fn check_reward(&self, block: &Block, tentative_height: u32, errors: &mut Vec<String>) {
        if tentative_height == 1 {
            return;
        }
        let expected = self.schedule.reward(tentative_height);
        if block.reward != expected {
            errors.push(format!(
                "Invalid block reward: {} expected: {expected}",
                block.reward
            ));
        }
    }

    fn check_id(&self, block: &Block, errors: &mut Vec<String>) {
        match block.compute_id() {
            Ok(id) if id == block.id => {}
            Ok(id) => errors.push(format!("Invalid block id: {} expected: {id}", block.id)),
            Err(e) => errors.push(format!("Failed to get block id: {e}")),
        }
    }

    fn check_payload(&self, block: &Block, errors: &mut Vec<String>) {
        if block.payload_length > self.params.max_payload_length {
            errors.push("Payload length is too long".into());
        }
        if block.transactions.len() != block.number_of_transactions as usize {
            errors.push("Included transactions do not match block transactions count".into());
        }
        if block.transactions.len() > self.params.max_txs_per_block {
            errors.push("Number of transactions exceeds maximum per block".into());
        }

        let mut payload = Vec::new();
        let mut seen: Vec<TxId> = Vec::new();
        let mut total_amount: u128 = 0;
        let mut total_fee: u128 = 0;
        for tx in &block.transactions {
            // A single malformed transaction must not abort the pass; every
            // failure is collected.
            match tx.signable_bytes(true) {
                Ok(bytes) => payload.extend_from_slice(&bytes),
                Err(e) => {
                    errors.push(format!("Failed to get transaction bytes: {e}"));
                    continue;
                }
            }
            match tx.id() {
                Ok(id) if seen.contains(&id) => {
                    errors.push(format!("Encountered duplicate transaction: {id}"))
                }
                Ok(id) => seen.push(id),
                Err(e) => errors.push(format!("Failed to get transaction id: {e}")),
            }
            total_amount += tx.amount;
            total_fee += tx.fee;
        }

        if sha256(&payload) != block.payload_hash {
            errors.push("Invalid payload hash".into());
        }
        if total_amount != block.total_amount {
            errors.push("Invalid total amount".into());
        }
        if total_fee != block.total_fee {
            errors.push("Invalid total fee".into());
        }
    }

    fn check_fork_one(&self, block: &Block, last_block: &Block, errors: &mut Vec<String>) {
        if let Some(previous) = block.previous_block {
            if previous != last_block.id {
                self.fork_observer.fork(block, ForkType::Type1);
                errors.push(format!(
                    "Invalid previous block: {previous} expected: {}",
                    last_block.id
                ));
            }
        }
    }
}
