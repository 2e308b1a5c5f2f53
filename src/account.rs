//! Typed account rows and the delta (merge) semantics the chain core uses.
//!
//! The chain core never writes absolute balances. Every mutation it issues is
//! an [`AccountDelta`] merged into the stored row, so applying a block and
//! undoing it are exact inverses by construction.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha256, PublicKey};
use crate::Amount;

/// A numeric account address derived from the account's public key:
/// the first 8 bytes of `sha256(publicKey)`, byte-reversed, as a u64.
///
/// Rendered as an unsigned decimal string with an `M` suffix.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    /// Derive the address for a public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = sha256(key.as_bytes());
        let mut bytes = [0u8; 8];
        for (i, b) in digest[..8].iter().enumerate() {
            bytes[7 - i] = *b;
        }
        Address(u64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}M", self.0)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({self})")
    }
}

impl std::str::FromStr for Address {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_suffix('M').unwrap_or(s);
        digits.parse::<u64>().map(Address)
    }
}

/// One account row.
///
/// `balance` is the confirmed balance; `unconfirmed_balance` additionally
/// reflects pool transactions provisionally applied ahead of inclusion.
/// Delegate fields (`vote_weight`, `produced_blocks`, `missed_blocks`,
/// `fees`, `rewards`) are only meaningful when `is_delegate` is set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub public_key: Option<PublicKey>,
    pub balance: Amount,
    pub unconfirmed_balance: Amount,
    pub is_delegate: bool,
    pub username: Option<String>,
    /// Total vote weight received, when a delegate.
    pub vote_weight: Amount,
    /// Delegates this account currently votes for.
    pub votes: Vec<PublicKey>,
    pub fees: Amount,
    pub rewards: Amount,
    pub produced_blocks: u64,
    pub missed_blocks: u64,
}

impl Account {
    /// A fresh, empty account at the given address.
    pub fn new(address: Address) -> Self {
        Account {
            address,
            public_key: None,
            balance: 0,
            unconfirmed_balance: 0,
            is_delegate: false,
            username: None,
            vote_weight: 0,
            votes: Vec::new(),
            fees: 0,
            rewards: 0,
            produced_blocks: 0,
            missed_blocks: 0,
        }
    }

    /// Merge a delta into this row. Fails without mutating anything if any
    /// field would underflow, so a failed merge aborts the whole storage unit.
    pub fn merge(&mut self, delta: &AccountDelta) -> Result<(), MergeError> {
        let balance = checked_add_signed(self.balance, delta.balance)?;
        let unconfirmed = checked_add_signed(self.unconfirmed_balance, delta.unconfirmed_balance)?;
        let vote_weight = checked_add_signed(self.vote_weight, delta.vote_weight)?;
        let fees = checked_add_signed(self.fees, delta.fees)?;
        let rewards = checked_add_signed(self.rewards, delta.rewards)?;
        let produced = checked_add_signed_u64(self.produced_blocks, delta.produced_blocks)?;
        let missed = checked_add_signed_u64(self.missed_blocks, delta.missed_blocks)?;

        self.balance = balance;
        self.unconfirmed_balance = unconfirmed;
        self.vote_weight = vote_weight;
        self.fees = fees;
        self.rewards = rewards;
        self.produced_blocks = produced;
        self.missed_blocks = missed;
        Ok(())
    }
}

/// A signed change-set over one account row. All fields are deltas; the
/// inverse of a delta is its negation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDelta {
    pub balance: i128,
    pub unconfirmed_balance: i128,
    pub vote_weight: i128,
    pub fees: i128,
    pub rewards: i128,
    pub produced_blocks: i64,
    pub missed_blocks: i64,
}

impl AccountDelta {
    /// A pure confirmed-balance delta.
    pub fn balance(delta: i128) -> Self {
        AccountDelta {
            balance: delta,
            ..Default::default()
        }
    }

    /// A pure unconfirmed-balance delta.
    pub fn unconfirmed(delta: i128) -> Self {
        AccountDelta {
            unconfirmed_balance: delta,
            ..Default::default()
        }
    }

    /// The exact inverse of this delta.
    pub fn negated(&self) -> Self {
        AccountDelta {
            balance: -self.balance,
            unconfirmed_balance: -self.unconfirmed_balance,
            vote_weight: -self.vote_weight,
            fees: -self.fees,
            rewards: -self.rewards,
            produced_blocks: -self.produced_blocks,
            missed_blocks: -self.missed_blocks,
        }
    }
}

/// Merge failure: a field would go negative.
#[derive(Clone, Debug, thiserror::Error)]
#[error("account merge underflow: {field} {current} {delta:+}")]
pub struct MergeError {
    pub field: &'static str,
    pub current: String,
    pub delta: i128,
}

fn checked_add_signed(value: Amount, delta: i128) -> Result<Amount, MergeError> {
    let result = (value as i128).checked_add(delta).filter(|v| *v >= 0);
    match result {
        Some(v) => Ok(v as Amount),
        None => Err(MergeError {
            field: "amount",
            current: value.to_string(),
            delta,
        }),
    }
}

fn checked_add_signed_u64(value: u64, delta: i64) -> Result<u64, MergeError> {
    let result = (value as i64).checked_add(delta).filter(|v| *v >= 0);
    match result {
        Some(v) => Ok(v as u64),
        None => Err(MergeError {
            field: "counter",
            current: value.to_string(),
            delta: delta as i128,
        }),
    }
}
