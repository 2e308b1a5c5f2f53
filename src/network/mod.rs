//! Peer transport contract.
//!
//! The chain core talks to the network through two seams: [`PeerClient`],
//! the request/response surface the sync loader drives (common-block
//! search, block download, block push), and [`Broadcaster`], the
//! fire-and-forget announcement of locally processed blocks. Transports
//! implement these against [`protocol`]'s length-prefixed binary messages;
//! the core never sees sockets.

pub mod protocol;

use std::sync::{Arc, Mutex};

use crate::block::{Block, BlockId};

pub use protocol::{decode_message, encode_message, CommonBlockInfo, Message};

/// Errors from peer interaction.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("invalid peer response: {0}")]
    InvalidResponse(String),
    #[error("message encoding failed: {0}")]
    Encoding(String),
    #[error("message exceeds maximum size")]
    Oversized,
}

/// One remote peer, from the sync loader's point of view.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    /// Stable label for logs and peer-set bookkeeping.
    fn label(&self) -> String;

    /// The peer's advertised chain height.
    async fn height(&self) -> Result<u32, NetworkError>;

    /// Intersect our id sequence with the peer's chain; the highest match.
    async fn get_common_block(
        &self,
        ids: &[BlockId],
    ) -> Result<Option<CommonBlockInfo>, NetworkError>;

    /// Blocks following `last_block_id`, oldest first, decoded from their
    /// wire envelopes.
    async fn get_blocks(&self, last_block_id: BlockId) -> Result<Vec<Block>, NetworkError>;

    /// Push one block; returns the peer's acceptance verdict.
    async fn post_block(&self, block: &Block) -> Result<bool, NetworkError>;
}

/// The peer set the sync loader draws from. Misbehaving peers are removed.
pub trait PeerPool: Send + Sync {
    fn list(&self) -> Vec<Arc<dyn PeerClient>>;
    fn remove(&self, label: &str);
}

/// Fixed peer set handed in at wiring time.
#[derive(Default)]
pub struct StaticPeerPool {
    peers: Mutex<Vec<Arc<dyn PeerClient>>>,
}

impl StaticPeerPool {
    pub fn new(peers: Vec<Arc<dyn PeerClient>>) -> Self {
        StaticPeerPool {
            peers: Mutex::new(peers),
        }
    }
}

impl PeerPool for StaticPeerPool {
    fn list(&self) -> Vec<Arc<dyn PeerClient>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn remove(&self, label: &str) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.label() != label);
    }
}

/// Fire-and-forget block announcement.
pub trait Broadcaster: Send + Sync {
    fn broadcast_block(&self, block: &Block);
}

/// Broadcaster that drops everything (isolated nodes, tests).
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast_block(&self, _block: &Block) {}
}
