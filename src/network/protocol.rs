//! Wire protocol messages for peer request/response exchange.
//!
//! Every payload is a length-prefixed opaque binary blob: a 4-byte
//! little-endian length followed by the bincode encoding of [`Message`].
//! Blocks travel as their own wire envelopes (see `block::to_wire`), so the
//! consensus-critical header bytes pass through this layer untouched.

use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::constants;
use crate::network::NetworkError;

/// The common-ancestor triple returned by a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonBlockInfo {
    pub id: BlockId,
    pub previous_block: Option<BlockId>,
    pub height: u32,
}

/// Peer protocol messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ── Chain state ──
    /// Request the peer's chain height.
    GetHeight,

    /// Response with the current height.
    HeightResponse { height: u32 },

    // ── Common-block search ──
    /// Offer an id sequence; the peer answers with its highest match.
    GetCommonBlock { ids: Vec<BlockId> },

    /// Response with the matched block, if any.
    CommonBlockResponse(Option<CommonBlockInfo>),

    // ── Block download ──
    /// Request blocks following the given block id, oldest first.
    GetBlocks { last_block_id: BlockId },

    /// Response with a batch of wire-envelope blocks.
    BlocksResponse { blocks: Vec<Vec<u8>> },

    // ── Block push ──
    /// Announce one wire-envelope block.
    PostBlock { block: Vec<u8> },

    /// Acceptance verdict for a pushed block.
    PostBlockResponse {
        success: bool,
        block_id: Option<BlockId>,
    },
}

/// Encode a message with its 4-byte little-endian length prefix.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let body = crate::serialize(msg).map_err(|e| NetworkError::Encoding(e.to_string()))?;
    if body.len() > constants::MAX_WIRE_BLOCK_BYTES {
        return Err(NetworkError::Oversized);
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a length-prefixed message. Returns `None` for anything malformed
/// or oversized; a bad peer never takes the decoder down.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 4 {
        return None;
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > constants::MAX_WIRE_BLOCK_BYTES || data.len() < 4 + len {
        return None;
    }
    crate::deserialize(&data[4..4 + len]).ok()
}
