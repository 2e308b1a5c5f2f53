//! Deterministic genesis block construction.
//!
//! A genesis block funds the treasury, registers the initial delegate set,
//! and casts the treasury's votes for every delegate. All timestamps are
//! zero and all keys derive from fixed secrets, so two nodes building the
//! dev genesis independently produce byte-identical blocks.

use crate::account::Address;
use crate::block::{sort_transactions, Block, BlockId};
use crate::crypto::{sha256, Keypair, Signature};
use crate::transaction::{Transaction, TxAsset, TxType, MAX_VOTES_PER_TX};
use crate::{ChainParams, Hash};

/// A constructed genesis block together with the keys behind it, for
/// bootstrapping dev networks and tests.
pub struct GenesisBundle {
    pub block: Block,
    /// Generator that signed the genesis block.
    pub generator: Keypair,
    /// Holder of the initial supply.
    pub treasury: Keypair,
    /// Forging keys of the initial delegates, in registration order.
    pub delegates: Vec<Keypair>,
}

/// Build the deterministic development genesis for the given parameters.
pub fn dev_genesis(params: &ChainParams) -> GenesisBundle {
    let generator = Keypair::from_secret("meridian dev genesis generator");
    let treasury = Keypair::from_secret("meridian dev treasury");
    let delegates: Vec<Keypair> = (0..params.active_delegates)
        .map(|i| Keypair::from_secret(&format!("meridian dev delegate {i}")))
        .collect();

    let mut transactions = Vec::new();

    // The entire initial supply lands on the treasury.
    let mut funding = Transaction {
        tx_type: TxType::Transfer,
        timestamp: 0,
        sender_public_key: generator.public,
        recipient_id: Some(Address::from_public_key(&treasury.public)),
        amount: params.total_amount,
        fee: 0,
        signature: Signature::empty(),
        asset: TxAsset::None,
    };
    // Genesis amounts can exceed the u64 wire range only through
    // misconfiguration; treat that as unrepresentable.
    funding
        .sign(&generator)
        .unwrap_or_else(|e| panic!("genesis funding transfer is unencodable: {e}"));
    transactions.push(funding);

    for (i, delegate) in delegates.iter().enumerate() {
        let mut registration = Transaction {
            tx_type: TxType::DelegateRegistration,
            timestamp: 0,
            sender_public_key: delegate.public,
            recipient_id: None,
            amount: 0,
            fee: 0,
            signature: Signature::empty(),
            asset: TxAsset::Delegate {
                username: format!("delegate_{i}"),
            },
        };
        registration
            .sign(delegate)
            .unwrap_or_else(|e| panic!("genesis registration is unencodable: {e}"));
        transactions.push(registration);
    }

    // Treasury votes for every delegate, chunked to the per-tx limit.
    for chunk in delegates.chunks(MAX_VOTES_PER_TX) {
        let mut vote = Transaction {
            tx_type: TxType::Vote,
            timestamp: 0,
            sender_public_key: treasury.public,
            recipient_id: None,
            amount: 0,
            fee: 0,
            signature: Signature::empty(),
            asset: TxAsset::Votes {
                added: chunk.iter().map(|kp| kp.public).collect(),
                removed: Vec::new(),
            },
        };
        vote.sign(&treasury)
            .unwrap_or_else(|e| panic!("genesis vote is unencodable: {e}"));
        transactions.push(vote);
    }

    sort_transactions(&mut transactions);
    let mut total_amount = 0;
    let mut payload = Vec::new();
    for tx in &transactions {
        total_amount += tx.amount;
        let bytes = tx
            .signable_bytes(true)
            .unwrap_or_else(|e| panic!("genesis transaction is unencodable: {e}"));
        payload.extend_from_slice(&bytes);
    }
    let payload_hash: Hash = sha256(&payload);

    let mut block = Block {
        id: BlockId(0),
        version: 0,
        timestamp: 0,
        previous_block: None,
        number_of_transactions: transactions.len() as u32,
        total_amount,
        total_fee: 0,
        reward: 0,
        payload_length: payload.len() as u32,
        payload_hash,
        generator_public_key: generator.public,
        block_signature: Signature::empty(),
        height: 1,
        transactions,
    };
    block
        .sign(&generator)
        .unwrap_or_else(|e| panic!("genesis block is unencodable: {e}"));
    block.id = block
        .compute_id()
        .unwrap_or_else(|e| panic!("genesis block id underivable: {e}"));

    GenesisBundle {
        block,
        generator,
        treasury,
        delegates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ChainParams {
        ChainParams {
            active_delegates: 5,
            ..ChainParams::default()
        }
    }

    #[test]
    fn dev_genesis_is_deterministic() {
        let params = small_params();
        let a = dev_genesis(&params);
        let b = dev_genesis(&params);
        assert_eq!(a.block, b.block);
        assert_eq!(a.block.id, b.block.id);
    }

    #[test]
    fn genesis_shape() {
        let params = small_params();
        let bundle = dev_genesis(&params);
        let block = &bundle.block;
        assert_eq!(block.height, 1);
        assert!(block.previous_block.is_none());
        assert_eq!(block.reward, 0);
        assert_eq!(block.total_fee, 0);
        assert_eq!(block.total_amount, params.total_amount);
        // 1 funding transfer + 5 registrations + 1 vote chunk.
        assert_eq!(block.transactions.len(), 7);
        assert!(block.verify_signature().unwrap());
    }

    #[test]
    fn genesis_votes_cover_every_delegate() {
        let bundle = dev_genesis(&small_params());
        let mut voted = Vec::new();
        for tx in &bundle.block.transactions {
            if let TxAsset::Votes { added, .. } = &tx.asset {
                voted.extend(added.iter().copied());
            }
        }
        for delegate in &bundle.delegates {
            assert!(voted.contains(&delegate.public));
        }
    }
}
