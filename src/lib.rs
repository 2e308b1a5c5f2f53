//! # Meridian
//!
//! A delegated-proof-of-stake (DPoS) blockchain node:
//! - **Canonical block format** — byte-exact little-endian headers, hash-derived
//!   numeric block ids, ed25519 generator signatures
//! - **Round-based forging** — 101 delegates per round, deterministic seeded
//!   ordering, exact integer fee/reward distribution
//! - **Atomic chain mutation** — every block applies or rolls back as one
//!   storage transaction; apply and undo are exact inverses
//! - **Fork resolution** — competing-chain (type 1) and double-forge (type 5)
//!   tie-breaks by timestamp, then block id
//! - **Peer sync** — common-ancestor search, rollback with chain backup, and
//!   best-effort restore when a sync attempt fails

pub mod account;
pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod genesis;
pub mod mempool;
pub mod network;
pub mod node;
pub mod rewards;
pub mod rounds;
pub mod storage;
pub mod sync;
pub mod transaction;
pub mod verifier;

/// Protocol constants
pub mod constants {
    use crate::Amount;

    /// Number of forging delegates per round.
    pub const ACTIVE_DELEGATES: usize = 101;
    /// Seconds between block slots.
    pub const BLOCK_TIME_SECS: u32 = 10;
    /// Ring buffer size for recently-seen block ids, and the number of
    /// trailing rounds sampled when building the common-block id sequence.
    pub const SLOT_WINDOW: usize = 5;
    /// Maximum transactions in one block.
    pub const MAX_TXS_PER_BLOCK: usize = 25;
    /// Maximum block payload size in bytes.
    pub const MAX_PAYLOAD_LENGTH: u32 = 1024 * 1024;
    /// Wire width of amount fields (little-endian unsigned).
    pub const AMOUNT_BYTES: usize = 8;
    /// Fixed block header size: version(4) timestamp(4) previous(8)
    /// tx-count(4) totalAmount(8) totalFee(8) reward(8) payloadLength(4)
    /// payloadHash(32) generatorPublicKey(32) signature(64).
    pub const BLOCK_HEADER_BYTES: usize = 4 + 4 + 8 + 4 + 8 + 8 + 8 + 4 + 32 + 32 + 64;

    /// Genesis epoch: 2020-01-01T00:00:00Z. Block timestamps count seconds
    /// from this instant.
    pub const GENESIS_EPOCH_UNIX: u64 = 1_577_836_800;

    /// Height at which forging rewards begin.
    pub const REWARD_OFFSET: u32 = 2_160;
    /// Heights between reward milestones.
    pub const REWARD_DISTANCE: u32 = 3_000_000;
    /// Per-block reward at each milestone, in base units.
    pub const REWARD_MILESTONES: [Amount; 5] = [
        500_000_000,
        400_000_000,
        300_000_000,
        200_000_000,
        100_000_000,
    ];
    /// Coins in existence at genesis, in base units.
    pub const TOTAL_AMOUNT: Amount = 10_000_000_000_000_000;

    /// Maximum wire-envelope size accepted from a peer, with headroom for
    /// the bincode framing around a maximum-payload block.
    pub const MAX_WIRE_BLOCK_BYTES: usize = 2 * 1024 * 1024;

    /// Retries per sync attempt before the peer is given up on.
    pub const SYNC_RETRIES: u32 = 3;
    /// Upper bound on the sync retry backoff, in milliseconds.
    pub const SYNC_RETRY_CAP_MS: u64 = 50_000;

    /// Default number of pending transactions held in the pool.
    pub const POOL_MAX_TXS: usize = 5_000;

    /// Default P2P listen port.
    pub const DEFAULT_P2P_PORT: u16 = 7000;
}

/// 32-byte SHA-256 digest used throughout the protocol.
pub type Hash = [u8; 32];

/// Unsigned coin amount in base units.
///
/// 128-bit in memory so round sums and supply math can never overflow;
/// encoded as a fixed 8-byte little-endian field on the wire.
pub type Amount = u128;

/// Chain parameters, defaulted from [`constants`] and overridable for tests
/// and private networks. Consensus-critical: two nodes disagreeing on any of
/// these will fork.
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub active_delegates: usize,
    pub block_time_secs: u32,
    pub slot_window: usize,
    pub max_txs_per_block: usize,
    pub max_payload_length: u32,
    pub genesis_epoch_unix: u64,
    pub reward_offset: u32,
    pub reward_distance: u32,
    pub reward_milestones: Vec<Amount>,
    pub total_amount: Amount,
    /// When set, finishing this round truncates any blocks above the current
    /// height (fast-resync bootstrapping from a snapshot).
    pub snapshot_round: Option<u64>,
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            active_delegates: constants::ACTIVE_DELEGATES,
            block_time_secs: constants::BLOCK_TIME_SECS,
            slot_window: constants::SLOT_WINDOW,
            max_txs_per_block: constants::MAX_TXS_PER_BLOCK,
            max_payload_length: constants::MAX_PAYLOAD_LENGTH,
            genesis_epoch_unix: constants::GENESIS_EPOCH_UNIX,
            reward_offset: constants::REWARD_OFFSET,
            reward_distance: constants::REWARD_DISTANCE,
            reward_milestones: constants::REWARD_MILESTONES.to_vec(),
            total_amount: constants::TOTAL_AMOUNT,
            snapshot_round: None,
        }
    }
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_WIRE_BLOCK_BYTES` to prevent OOM from
/// oversized peer payloads.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_WIRE_BLOCK_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_roundtrip() {
        let val: Vec<u64> = vec![1, 2, 3];
        let bytes = serialize(&val).unwrap();
        let back: Vec<u64> = deserialize(&bytes).unwrap();
        assert_eq!(val, back);
    }

    #[test]
    fn deserialize_rejects_oversized() {
        let bytes = vec![0u8; constants::MAX_WIRE_BLOCK_BYTES + 1];
        assert!(deserialize::<Vec<u64>>(&bytes).is_err());
    }

    #[test]
    fn default_params_match_constants() {
        let params = ChainParams::default();
        assert_eq!(params.active_delegates, constants::ACTIVE_DELEGATES);
        assert_eq!(params.reward_milestones.len(), 5);
    }
}
