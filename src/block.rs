//! Canonical block format: byte layout, identity, signing, normalization,
//! and the peer wire envelope.
//!
//! The signable byte layout is consensus-critical. Fields are concatenated
//! little-endian in a fixed order: version(4) timestamp(4)
//! previousBlockId(8, zero-filled when absent) numberOfTransactions(4)
//! totalAmount(8) totalFee(8) reward(8) payloadLength(4) payloadHash(32)
//! generatorPublicKey(32), then the 64-byte signature when requested and
//! present. The block id is the byte-reversed tail of the SHA-256 over the
//! signed encoding, so any change to field order or width changes every id.

use serde::{Deserialize, Serialize};

use crate::account::Address;
use crate::crypto::{numeric_id, sha256, Keypair, PublicKey, Signature, PUBLIC_KEY_BYTES,
    SIGNATURE_BYTES};
use crate::transaction::{max_single_tx_bytes, Transaction};
use crate::{constants, Amount, ChainParams, Hash};

/// Errors from block encoding and decoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BlockError {
    #[error("amount field exceeds wire range")]
    AmountOverflow,
    #[error("block is not signed")]
    MissingSignature,
    #[error("bad header length: expected {expected}, got {got}")]
    BadHeaderLength { expected: usize, got: usize },
    #[error("transaction encoding failed: {0}")]
    Transaction(#[from] crate::transaction::TxError),
    #[error("wire envelope decode failed: {0}")]
    WireDecode(String),
}

/// Structural validation failure. Collects every violation found in one
/// pass rather than stopping at the first.
#[derive(Clone, Debug, thiserror::Error)]
#[error("block failed schema validation: {}", violations.join("; "))]
pub struct SchemaError {
    pub violations: Vec<String>,
}

/// Numeric block id rendered as an unsigned decimal string; a pure function
/// of the signed header bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl std::str::FromStr for BlockId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(BlockId)
    }
}

/// One block. Immutable once signed; `id` is derived from the signed header
/// bytes and cached at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub version: u32,
    /// Seconds since the genesis epoch.
    pub timestamp: u32,
    pub previous_block: Option<BlockId>,
    pub number_of_transactions: u32,
    pub total_amount: Amount,
    pub total_fee: Amount,
    pub reward: Amount,
    pub payload_length: u32,
    pub payload_hash: Hash,
    pub generator_public_key: PublicKey,
    pub block_signature: Signature,
    /// Not part of the wire header; attached out-of-band.
    pub height: u32,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build, sign, and id a new block on top of `previous`.
    pub fn create(
        previous: &Block,
        timestamp: u32,
        reward: Amount,
        mut transactions: Vec<Transaction>,
        keypair: &Keypair,
    ) -> Result<Block, BlockError> {
        sort_transactions(&mut transactions);
        let mut total_amount: Amount = 0;
        let mut total_fee: Amount = 0;
        let mut payload = Vec::new();
        for tx in &transactions {
            total_amount += tx.amount;
            total_fee += tx.fee;
            payload.extend_from_slice(&tx.signable_bytes(true)?);
        }

        let mut block = Block {
            id: BlockId(0),
            version: 0,
            timestamp,
            previous_block: Some(previous.id),
            number_of_transactions: transactions.len() as u32,
            total_amount,
            total_fee,
            reward,
            payload_length: payload.len() as u32,
            payload_hash: sha256(&payload),
            generator_public_key: keypair.public,
            block_signature: Signature::empty(),
            height: previous.height + 1,
            transactions,
        };
        block.sign(keypair)?;
        block.id = block.compute_id()?;
        Ok(block)
    }

    /// Canonical byte encoding of the header fields, in the fixed order.
    pub fn signable_bytes(&self, include_signature: bool) -> Result<Vec<u8>, BlockError> {
        let mut out = Vec::with_capacity(constants::BLOCK_HEADER_BYTES);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        let previous = self.previous_block.map(|id| id.0).unwrap_or(0);
        out.extend_from_slice(&previous.to_le_bytes());
        out.extend_from_slice(&self.number_of_transactions.to_le_bytes());
        out.extend_from_slice(&amount_wire(self.total_amount)?);
        out.extend_from_slice(&amount_wire(self.total_fee)?);
        out.extend_from_slice(&amount_wire(self.reward)?);
        out.extend_from_slice(&self.payload_length.to_le_bytes());
        out.extend_from_slice(&self.payload_hash);
        out.extend_from_slice(self.generator_public_key.as_bytes());
        if include_signature && !self.block_signature.is_empty() {
            out.extend_from_slice(self.block_signature.as_bytes());
        }
        Ok(out)
    }

    /// Sign the header with the generator keypair.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), BlockError> {
        let digest = sha256(&self.signable_bytes(false)?);
        self.block_signature = keypair.sign(&digest);
        Ok(())
    }

    /// Verify the generator signature over the unsigned header bytes.
    pub fn verify_signature(&self) -> Result<bool, BlockError> {
        if self.block_signature.is_empty() {
            return Ok(false);
        }
        let digest = sha256(&self.signable_bytes(false)?);
        Ok(self.generator_public_key.verify(&digest, &self.block_signature))
    }

    /// Recompute the derived id from the signed header bytes.
    pub fn compute_id(&self) -> Result<BlockId, BlockError> {
        if self.block_signature.is_empty() {
            return Err(BlockError::MissingSignature);
        }
        let bytes = self.signable_bytes(true)?;
        Ok(BlockId(numeric_id(&sha256(&bytes))))
    }

    /// The generator's account address.
    pub fn generator_id(&self) -> Address {
        Address::from_public_key(&self.generator_public_key)
    }

    /// Wire envelope for peer transport: the signed header plus height and
    /// transactions, bincode encoded.
    pub fn to_wire(&self) -> Result<Vec<u8>, BlockError> {
        if self.block_signature.is_empty() {
            return Err(BlockError::MissingSignature);
        }
        let wire = WireBlock {
            header: self.signable_bytes(true)?,
            height: self.height,
            transactions: self.transactions.clone(),
        };
        crate::serialize(&wire).map_err(|e| BlockError::WireDecode(e.to_string()))
    }

    /// Decode a wire envelope back into a block. The id is re-derived from
    /// the header bytes; payload consistency is the verifier's concern.
    pub fn from_wire(bytes: &[u8]) -> Result<Block, BlockError> {
        let wire: WireBlock =
            crate::deserialize(bytes).map_err(|e| BlockError::WireDecode(e.to_string()))?;
        Self::from_header_bytes(&wire.header, wire.height, wire.transactions)
    }

    /// Decode the fixed header layout, attaching height and transactions.
    pub fn from_header_bytes(
        header: &[u8],
        height: u32,
        transactions: Vec<Transaction>,
    ) -> Result<Block, BlockError> {
        if header.len() != constants::BLOCK_HEADER_BYTES {
            return Err(BlockError::BadHeaderLength {
                expected: constants::BLOCK_HEADER_BYTES,
                got: header.len(),
            });
        }
        let mut cursor = Cursor { buf: header, at: 0 };
        let version = cursor.u32();
        let timestamp = cursor.u32();
        let previous = cursor.u64();
        let number_of_transactions = cursor.u32();
        let total_amount = cursor.u64() as Amount;
        let total_fee = cursor.u64() as Amount;
        let reward = cursor.u64() as Amount;
        let payload_length = cursor.u32();
        let payload_hash = cursor.hash();
        let generator_public_key = PublicKey(cursor.hash());
        let block_signature = Signature::from_bytes(cursor.take(SIGNATURE_BYTES).to_vec());

        let mut block = Block {
            id: BlockId(0),
            version,
            timestamp,
            previous_block: (previous != 0).then_some(BlockId(previous)),
            number_of_transactions,
            total_amount,
            total_fee,
            reward,
            payload_length,
            payload_hash,
            generator_public_key,
            block_signature,
            height,
            transactions,
        };
        block.id = block.compute_id()?;
        Ok(block)
    }

    /// Project this block back into its loose representation.
    pub fn to_raw(&self) -> RawBlock {
        RawBlock {
            id: Some(self.id.to_string()),
            version: Some(self.version),
            timestamp: Some(self.timestamp),
            previous_block: self.previous_block.map(|id| id.to_string()),
            number_of_transactions: Some(self.number_of_transactions),
            total_amount: Some(self.total_amount.to_string()),
            total_fee: Some(self.total_fee.to_string()),
            reward: Some(self.reward.to_string()),
            payload_length: Some(self.payload_length),
            payload_hash: Some(hex::encode(self.payload_hash)),
            generator_public_key: Some(self.generator_public_key.to_hex()),
            block_signature: Some(self.block_signature.to_hex()),
            height: Some(self.height),
            transactions: self.transactions.clone(),
        }
    }

    /// Smallest possible serialized block: the bare header.
    pub fn min_bytes_size(_params: &ChainParams) -> usize {
        constants::BLOCK_HEADER_BYTES
    }

    /// Largest possible serialized block: header plus a full complement of
    /// maximum-size transactions. Bounds sync batch sizing.
    pub fn max_bytes_size(params: &ChainParams) -> usize {
        constants::BLOCK_HEADER_BYTES + params.max_txs_per_block * max_single_tx_bytes()
    }
}

/// Canonical in-block transaction order: by type, then id.
pub fn sort_transactions(transactions: &mut [Transaction]) {
    transactions.sort_by_key(|tx| {
        (
            tx.tx_type.wire_id(),
            tx.id().map(|id| id.0).unwrap_or(u64::MAX),
        )
    });
}

#[derive(Serialize, Deserialize)]
struct WireBlock {
    header: Vec<u8>,
    height: u32,
    transactions: Vec<Transaction>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.buf[self.at..self.at + n];
        self.at += n;
        slice
    }

    fn u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4));
        u32::from_le_bytes(bytes)
    }

    fn u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8));
        u64::from_le_bytes(bytes)
    }

    fn hash(&mut self) -> Hash {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.take(32));
        bytes
    }
}

fn amount_wire(value: Amount) -> Result<[u8; 8], BlockError> {
    u64::try_from(value)
        .map(|v| v.to_le_bytes())
        .map_err(|_| BlockError::AmountOverflow)
}

/// Loosely-typed block as produced by peers' JSON-ish surfaces: hex strings
/// for keys and hashes, decimal strings for amounts and ids, everything
/// optional. [`RawBlock::normalize`] turns this into a typed [`Block`],
/// reporting every structural violation at once.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBlock {
    pub id: Option<String>,
    pub version: Option<u32>,
    pub timestamp: Option<u32>,
    pub previous_block: Option<String>,
    pub number_of_transactions: Option<u32>,
    pub total_amount: Option<String>,
    pub total_fee: Option<String>,
    pub reward: Option<String>,
    pub payload_length: Option<u32>,
    pub payload_hash: Option<String>,
    pub generator_public_key: Option<String>,
    pub block_signature: Option<String>,
    pub height: Option<u32>,
    pub transactions: Vec<Transaction>,
}

impl RawBlock {
    /// Validate structure and coerce into a typed [`Block`].
    ///
    /// Idempotent: a block projected with [`Block::to_raw`] normalizes back
    /// to an identical block. The stated id, when present, must match the
    /// recomputed one.
    pub fn normalize(&self) -> Result<Block, SchemaError> {
        let mut violations = Vec::new();

        let version = require(&mut violations, "version", self.version);
        let timestamp = require(&mut violations, "timestamp", self.timestamp);
        let number_of_transactions =
            require(&mut violations, "numberOfTransactions", self.number_of_transactions);
        let payload_length = require(&mut violations, "payloadLength", self.payload_length);

        let total_amount = parse_amount(&mut violations, "totalAmount", &self.total_amount);
        let total_fee = parse_amount(&mut violations, "totalFee", &self.total_fee);
        let reward = parse_amount(&mut violations, "reward", &self.reward);

        let previous_block = match &self.previous_block {
            None => None,
            Some(s) => match s.parse::<BlockId>() {
                Ok(id) => Some(id),
                Err(_) => {
                    violations.push(format!("previousBlock is not a numeric id: {s:?}"));
                    None
                }
            },
        };

        let payload_hash = parse_fixed_hex(&mut violations, "payloadHash", &self.payload_hash, 32);
        let generator = parse_fixed_hex(
            &mut violations,
            "generatorPublicKey",
            &self.generator_public_key,
            PUBLIC_KEY_BYTES,
        );
        let signature = parse_fixed_hex(
            &mut violations,
            "blockSignature",
            &self.block_signature,
            SIGNATURE_BYTES,
        );

        if let Some(height) = self.height {
            if height < 1 {
                violations.push("height must be >= 1".into());
            }
            if height == 1 && self.previous_block.is_some() {
                violations.push("genesis block must not reference a previous block".into());
            }
            if height > 1 && self.previous_block.is_none() {
                violations.push("previousBlock is required above height 1".into());
            }
        }

        if !violations.is_empty() {
            return Err(SchemaError { violations });
        }

        // All parses succeeded above; defaults below are unreachable and
        // exist only to avoid unwraps.
        let mut payload = [0u8; 32];
        payload.copy_from_slice(&payload_hash.unwrap_or_else(|| vec![0; 32]));
        let mut generator_key = [0u8; PUBLIC_KEY_BYTES];
        generator_key.copy_from_slice(&generator.unwrap_or_else(|| vec![0; PUBLIC_KEY_BYTES]));

        let mut block = Block {
            id: BlockId(0),
            version: version.unwrap_or(0),
            timestamp: timestamp.unwrap_or(0),
            previous_block,
            number_of_transactions: number_of_transactions.unwrap_or(0),
            total_amount: total_amount.unwrap_or(0),
            total_fee: total_fee.unwrap_or(0),
            reward: reward.unwrap_or(0),
            payload_length: payload_length.unwrap_or(0),
            payload_hash: payload,
            generator_public_key: PublicKey(generator_key),
            block_signature: Signature::from_bytes(signature.unwrap_or_default()),
            height: self.height.unwrap_or(0),
            transactions: self.transactions.clone(),
        };

        match block.compute_id() {
            Ok(id) => block.id = id,
            Err(e) => {
                return Err(SchemaError {
                    violations: vec![format!("cannot derive block id: {e}")],
                })
            }
        }
        if let Some(stated) = &self.id {
            if stated.parse::<BlockId>().ok() != Some(block.id) {
                return Err(SchemaError {
                    violations: vec![format!(
                        "stated id {stated:?} does not match derived id {}",
                        block.id
                    )],
                });
            }
        }
        Ok(block)
    }
}

fn require<T: Copy>(violations: &mut Vec<String>, field: &str, value: Option<T>) -> Option<T> {
    if value.is_none() {
        violations.push(format!("missing required field: {field}"));
    }
    value
}

fn parse_amount(
    violations: &mut Vec<String>,
    field: &str,
    value: &Option<String>,
) -> Option<Amount> {
    match value {
        None => {
            violations.push(format!("missing required field: {field}"));
            None
        }
        Some(s) => match s.parse::<Amount>() {
            Ok(v) => Some(v),
            Err(_) => {
                violations.push(format!("{field} is not a non-negative integer: {s:?}"));
                None
            }
        },
    }
}

fn parse_fixed_hex(
    violations: &mut Vec<String>,
    field: &str,
    value: &Option<String>,
    expected_len: usize,
) -> Option<Vec<u8>> {
    match value {
        None => {
            violations.push(format!("missing required field: {field}"));
            None
        }
        Some(s) => match hex::decode(s) {
            Ok(bytes) if bytes.len() == expected_len => Some(bytes),
            Ok(bytes) => {
                violations.push(format!(
                    "{field} has wrong length: expected {expected_len} bytes, got {}",
                    bytes.len()
                ));
                None
            }
            Err(_) => {
                violations.push(format!("{field} is not valid hex"));
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis;

    fn params() -> ChainParams {
        ChainParams::default()
    }

    fn signed_block(tx_count: usize) -> Block {
        let forger = Keypair::from_secret("block codec forger");
        let previous = genesis::dev_genesis(&params()).block;
        let transactions: Vec<Transaction> = (0..tx_count)
            .map(|i| {
                let sender = Keypair::from_secret(&format!("codec sender {i}"));
                let recipient = Keypair::from_secret("codec recipient");
                let mut tx = Transaction {
                    tx_type: crate::transaction::TxType::Transfer,
                    timestamp: 100 + i as u32,
                    sender_public_key: sender.public,
                    recipient_id: Some(Address::from_public_key(&recipient.public)),
                    amount: 1_000 + i as Amount,
                    fee: 10,
                    signature: Signature::empty(),
                    asset: crate::transaction::TxAsset::None,
                };
                tx.sign(&sender).unwrap();
                tx
            })
            .collect();
        Block::create(&previous, 120, 0, transactions, &forger).unwrap()
    }

    #[test]
    fn header_bytes_have_fixed_size() {
        let block = signed_block(2);
        let bytes = block.signable_bytes(true).unwrap();
        assert_eq!(bytes.len(), constants::BLOCK_HEADER_BYTES);
        let without_sig = block.signable_bytes(false).unwrap();
        assert_eq!(without_sig.len(), constants::BLOCK_HEADER_BYTES - SIGNATURE_BYTES);
    }

    #[test]
    fn wire_roundtrip_preserves_block() {
        for tx_count in [0, 3] {
            let block = signed_block(tx_count);
            let wire = block.to_wire().unwrap();
            let back = Block::from_wire(&wire).unwrap();
            assert_eq!(block, back);
        }
    }

    #[test]
    fn id_is_pure_function_of_bytes() {
        let a = signed_block(1);
        let b = Block::from_wire(&a.to_wire().unwrap()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.compute_id().unwrap(), b.compute_id().unwrap());
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let block = signed_block(1);
        assert!(block.verify_signature().unwrap());
        let mut tampered = block.clone();
        tampered.reward += 1;
        assert!(!tampered.verify_signature().unwrap());
    }

    #[test]
    fn previous_block_zero_decodes_to_none() {
        let g = genesis::dev_genesis(&params()).block;
        assert!(g.previous_block.is_none());
        let wire = g.to_wire().unwrap();
        let back = Block::from_wire(&wire).unwrap();
        assert!(back.previous_block.is_none());
    }

    #[test]
    fn normalize_is_idempotent() {
        let block = signed_block(2);
        let once = block.to_raw().normalize().unwrap();
        let twice = once.to_raw().normalize().unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, block);
    }

    #[test]
    fn normalize_collects_every_violation() {
        let raw = RawBlock {
            version: None,                                // missing
            total_amount: Some("not-a-number".into()),    // malformed
            payload_hash: Some("abcd".into()),            // wrong length
            generator_public_key: Some("zz".into()),      // bad hex
            ..Default::default()
        };
        let err = raw.normalize().unwrap_err();
        assert!(err.violations.len() >= 6, "violations: {:?}", err.violations);
        assert!(err
            .violations
            .iter()
            .any(|v| v.contains("missing required field: version")));
        assert!(err.violations.iter().any(|v| v.contains("totalAmount")));
    }

    #[test]
    fn normalize_enforces_previous_block_presence_rules() {
        // Genesis must not carry a previous block.
        let genesis = genesis::dev_genesis(&params()).block;
        let mut raw = genesis.to_raw();
        raw.previous_block = Some("99".into());
        let err = raw.normalize().unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| v.contains("must not reference a previous block")));

        // Everything above genesis must.
        let block = signed_block(0);
        let mut raw = block.to_raw();
        raw.previous_block = None;
        let err = raw.normalize().unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| v.contains("previousBlock is required")));
    }

    #[test]
    fn normalize_rejects_mismatched_stated_id() {
        let block = signed_block(0);
        let mut raw = block.to_raw();
        raw.id = Some("12345".into());
        assert!(raw.normalize().is_err());
    }

    #[test]
    fn size_bounds() {
        let params = params();
        assert_eq!(Block::min_bytes_size(&params), constants::BLOCK_HEADER_BYTES);
        assert!(Block::max_bytes_size(&params) > Block::min_bytes_size(&params));
    }
}
