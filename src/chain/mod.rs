//! Chain state transitions: the mutator (atomic apply/undo of single
//! blocks) and the processor (verification orchestration, fork resolution,
//! local block generation).

pub mod mutator;
pub mod processor;

pub use mutator::ChainMutator;
pub use processor::{ChainProcessor, ReceiveOutcome};

use crate::block::BlockId;
use crate::transaction::TxId;

/// Errors from chain state transitions.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("node is shutting down")]
    ShuttingDown,
    #[error("cannot delete genesis block")]
    GenesisDelete,
    /// Fatal: a corrupt genesis makes the node unusable.
    #[error("genesis corruption: {0}")]
    GenesisCorruption(String),
    #[error("block verification failed: {0:?}")]
    Verification(Vec<String>),
    #[error("block {0} already processed")]
    AlreadyProcessed(BlockId),
    #[error("transaction {0} is already confirmed")]
    TxAlreadyConfirmed(TxId),
    #[error("missing block: {0}")]
    MissingBlock(String),
    #[error(transparent)]
    Schema(#[from] crate::block::SchemaError),
    #[error(transparent)]
    Block(#[from] crate::block::BlockError),
    #[error(transparent)]
    Tx(#[from] crate::transaction::TxError),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    Round(#[from] crate::rounds::RoundError),
}
