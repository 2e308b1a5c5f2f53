//! Transactions and the per-type apply/undo contract.
//!
//! The chain core treats transaction types through the [`TxHandler`]
//! contract: verify business rules, and translate apply/undo (confirmed and
//! provisional) into storage operations. Three built-in types exercise the
//! contract end-to-end: balance transfers, delegate registration, and votes.
//!
//! Byte layout (little-endian, fixed order): type(1) timestamp(4)
//! senderPublicKey(32) recipientId(8, zero when absent) amount(8) fee(8)
//! asset bytes, then the 64-byte signature when present. Transaction ids
//! derive from the SHA-256 of the full bytes the same way block ids do.

use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountDelta, Address};
use crate::crypto::{numeric_id, sha256, Keypair, PublicKey, Signature};
use crate::storage::{Storage, StorageOp};
use crate::Amount;

/// Maximum delegate username length.
pub const MAX_USERNAME_LEN: usize = 20;
/// Maximum vote operations in one vote transaction.
pub const MAX_VOTES_PER_TX: usize = 33;
/// Fixed byte size shared by every type: all fields except the asset.
pub const TX_BASE_BYTES: usize = 1 + 4 + 32 + 8 + 8 + 8 + 64;

/// Errors from transaction encoding, verification, and application.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxError {
    #[error("amount exceeds wire range")]
    AmountOverflow,
    #[error("unknown transaction type {0}")]
    UnknownType(u8),
    #[error("transfer requires a recipient")]
    MissingRecipient,
    #[error("insufficient balance for {address}: required {required}, available {available}")]
    InsufficientBalance {
        address: Address,
        required: Amount,
        available: Amount,
    },
    #[error("account {0} is already a delegate")]
    AlreadyDelegate(Address),
    #[error("invalid delegate username {0:?}")]
    InvalidUsername(String),
    #[error("delegate username {0:?} already registered")]
    UsernameTaken(String),
    #[error("vote target {0} is not a registered delegate")]
    NotADelegate(String),
    #[error("already voting for delegate {0}")]
    AlreadyVoted(String),
    #[error("not voting for delegate {0}")]
    NotVoted(String),
    #[error("too many votes in one transaction: {0}")]
    TooManyVotes(usize),
    #[error("invalid transaction signature")]
    InvalidSignature,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Numeric transaction id rendered as an unsigned decimal string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxId({})", self.0)
    }
}

impl std::str::FromStr for TxId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(TxId)
    }
}

/// Transaction type tag. The wire byte values are part of consensus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TxType {
    Transfer,
    DelegateRegistration,
    Vote,
}

impl TxType {
    pub fn wire_id(self) -> u8 {
        match self {
            TxType::Transfer => 0,
            TxType::DelegateRegistration => 2,
            TxType::Vote => 3,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Self, TxError> {
        match id {
            0 => Ok(TxType::Transfer),
            2 => Ok(TxType::DelegateRegistration),
            3 => Ok(TxType::Vote),
            other => Err(TxError::UnknownType(other)),
        }
    }

    /// Genesis application order: votes must land after the registrations
    /// and transfers they depend on.
    pub fn genesis_order(self) -> u8 {
        match self {
            TxType::Transfer => 0,
            TxType::DelegateRegistration => 1,
            TxType::Vote => 2,
        }
    }
}

/// Type-specific payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxAsset {
    None,
    Delegate { username: String },
    Votes { added: Vec<PublicKey>, removed: Vec<PublicKey> },
}

impl TxAsset {
    fn bytes(&self) -> Vec<u8> {
        match self {
            TxAsset::None => Vec::new(),
            TxAsset::Delegate { username } => username.as_bytes().to_vec(),
            TxAsset::Votes { added, removed } => {
                let mut out = Vec::with_capacity(33 * (added.len() + removed.len()));
                for key in added {
                    out.push(b'+');
                    out.extend_from_slice(key.as_bytes());
                }
                for key in removed {
                    out.push(b'-');
                    out.extend_from_slice(key.as_bytes());
                }
                out
            }
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            TxAsset::None => 0,
            TxAsset::Delegate { username } => username.len(),
            TxAsset::Votes { added, removed } => 33 * (added.len() + removed.len()),
        }
    }
}

/// One transaction, immutable once signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_type: TxType,
    /// Seconds since the genesis epoch.
    pub timestamp: u32,
    pub sender_public_key: PublicKey,
    pub recipient_id: Option<Address>,
    pub amount: Amount,
    pub fee: Amount,
    pub signature: Signature,
    pub asset: TxAsset,
}

impl Transaction {
    /// The canonical byte encoding, optionally including the signature.
    pub fn signable_bytes(&self, include_signature: bool) -> Result<Vec<u8>, TxError> {
        let mut out = Vec::with_capacity(TX_BASE_BYTES + self.asset.byte_len());
        out.push(self.tx_type.wire_id());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.sender_public_key.as_bytes());
        let recipient = self.recipient_id.map(|a| a.0).unwrap_or(0);
        out.extend_from_slice(&recipient.to_le_bytes());
        out.extend_from_slice(&amount_wire(self.amount)?);
        out.extend_from_slice(&amount_wire(self.fee)?);
        out.extend_from_slice(&self.asset.bytes());
        if include_signature && !self.signature.is_empty() {
            out.extend_from_slice(self.signature.as_bytes());
        }
        Ok(out)
    }

    /// Derived transaction id over the full (signed) bytes.
    pub fn id(&self) -> Result<TxId, TxError> {
        let bytes = self.signable_bytes(true)?;
        Ok(TxId(numeric_id(&sha256(&bytes))))
    }

    /// The sender address derived from the sender public key.
    pub fn sender_id(&self) -> Address {
        Address::from_public_key(&self.sender_public_key)
    }

    /// Sign with the sender keypair, replacing any existing signature.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), TxError> {
        let digest = sha256(&self.signable_bytes(false)?);
        self.signature = keypair.sign(&digest);
        Ok(())
    }

    /// Verify the sender signature over the unsigned bytes.
    pub fn verify_signature(&self) -> Result<bool, TxError> {
        if self.signature.is_empty() {
            return Ok(false);
        }
        let digest = sha256(&self.signable_bytes(false)?);
        Ok(self.sender_public_key.verify(&digest, &self.signature))
    }

    /// Exact serialized size in bytes.
    pub fn bytes_size(&self) -> usize {
        TX_BASE_BYTES + self.asset.byte_len()
    }
}

fn amount_wire(value: Amount) -> Result<[u8; 8], TxError> {
    u64::try_from(value)
        .map(|v| v.to_le_bytes())
        .map_err(|_| TxError::AmountOverflow)
}

/// The per-type contract the chain core consumes: business verification and
/// the translation of confirmed/provisional apply and undo into storage
/// operations. Implementations are pure with respect to storage: they return
/// operations, they do not execute them.
pub trait TxHandler: Send + Sync {
    /// Business rules for this type against the current sender row.
    fn verify(
        &self,
        tx: &Transaction,
        sender: &Account,
        store: &dyn Storage,
    ) -> Result<(), TxError>;

    /// Confirmed application.
    fn apply(&self, tx: &Transaction, sender: &Account) -> Result<Vec<StorageOp>, TxError>;

    /// Exact inverse of [`TxHandler::apply`].
    fn undo(&self, tx: &Transaction, sender: &Account) -> Result<Vec<StorageOp>, TxError>;

    /// Provisional application against the unconfirmed balance, used while
    /// the transaction waits in the pool.
    fn apply_unconfirmed(
        &self,
        tx: &Transaction,
        sender: &Account,
    ) -> Result<Vec<StorageOp>, TxError>;

    /// Exact inverse of [`TxHandler::apply_unconfirmed`].
    fn undo_unconfirmed(&self, tx: &Transaction) -> Result<Vec<StorageOp>, TxError>;

    /// Serialized size bounds for this type, used to bound block batches.
    fn min_bytes_size(&self) -> usize;
    fn max_bytes_size(&self) -> usize;
}

/// Look up the handler for a type. Static dispatch table; the set of types
/// is fixed per protocol version.
pub fn handler_for(tx_type: TxType) -> &'static dyn TxHandler {
    match tx_type {
        TxType::Transfer => &TransferHandler,
        TxType::DelegateRegistration => &DelegateHandler,
        TxType::Vote => &VoteHandler,
    }
}

/// Largest serialized size across all registered types.
pub fn max_single_tx_bytes() -> usize {
    [
        handler_for(TxType::Transfer).max_bytes_size(),
        handler_for(TxType::DelegateRegistration).max_bytes_size(),
        handler_for(TxType::Vote).max_bytes_size(),
    ]
    .into_iter()
    .max()
    .unwrap_or(TX_BASE_BYTES)
}

fn debit(tx: &Transaction) -> Result<i128, TxError> {
    let total = tx
        .amount
        .checked_add(tx.fee)
        .ok_or(TxError::AmountOverflow)?;
    i128::try_from(total).map_err(|_| TxError::AmountOverflow)
}

fn check_balance(required: Amount, available: Amount, address: Address) -> Result<(), TxError> {
    if available < required {
        return Err(TxError::InsufficientBalance {
            address,
            required,
            available,
        });
    }
    Ok(())
}

/// Type 0: balance transfer.
pub struct TransferHandler;

impl TxHandler for TransferHandler {
    fn verify(
        &self,
        tx: &Transaction,
        sender: &Account,
        _store: &dyn Storage,
    ) -> Result<(), TxError> {
        if tx.recipient_id.is_none() {
            return Err(TxError::MissingRecipient);
        }
        let total = tx
            .amount
            .checked_add(tx.fee)
            .ok_or(TxError::AmountOverflow)?;
        check_balance(total, sender.balance, sender.address)
    }

    fn apply(&self, tx: &Transaction, sender: &Account) -> Result<Vec<StorageOp>, TxError> {
        let recipient = tx.recipient_id.ok_or(TxError::MissingRecipient)?;
        let amount = i128::try_from(tx.amount).map_err(|_| TxError::AmountOverflow)?;
        // The sender's unconfirmed balance was already debited at the
        // provisional stage; the recipient sees the credit on both.
        Ok(vec![
            StorageOp::MergeAccount(sender.address, AccountDelta::balance(-debit(tx)?)),
            StorageOp::MergeAccount(
                recipient,
                AccountDelta {
                    balance: amount,
                    unconfirmed_balance: amount,
                    ..Default::default()
                },
            ),
        ])
    }

    fn undo(&self, tx: &Transaction, sender: &Account) -> Result<Vec<StorageOp>, TxError> {
        let recipient = tx.recipient_id.ok_or(TxError::MissingRecipient)?;
        let amount = i128::try_from(tx.amount).map_err(|_| TxError::AmountOverflow)?;
        Ok(vec![
            StorageOp::MergeAccount(sender.address, AccountDelta::balance(debit(tx)?)),
            StorageOp::MergeAccount(
                recipient,
                AccountDelta {
                    balance: -amount,
                    unconfirmed_balance: -amount,
                    ..Default::default()
                },
            ),
        ])
    }

    fn apply_unconfirmed(
        &self,
        tx: &Transaction,
        sender: &Account,
    ) -> Result<Vec<StorageOp>, TxError> {
        let total = tx
            .amount
            .checked_add(tx.fee)
            .ok_or(TxError::AmountOverflow)?;
        check_balance(total, sender.unconfirmed_balance, sender.address)?;
        Ok(vec![StorageOp::MergeAccount(
            sender.address,
            AccountDelta::unconfirmed(-debit(tx)?),
        )])
    }

    fn undo_unconfirmed(&self, tx: &Transaction) -> Result<Vec<StorageOp>, TxError> {
        Ok(vec![StorageOp::MergeAccount(
            tx.sender_id(),
            AccountDelta::unconfirmed(debit(tx)?),
        )])
    }

    fn min_bytes_size(&self) -> usize {
        TX_BASE_BYTES
    }

    fn max_bytes_size(&self) -> usize {
        TX_BASE_BYTES
    }
}

/// Type 2: delegate registration.
pub struct DelegateHandler;

fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_USERNAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl TxHandler for DelegateHandler {
    fn verify(
        &self,
        tx: &Transaction,
        sender: &Account,
        store: &dyn Storage,
    ) -> Result<(), TxError> {
        let TxAsset::Delegate { username } = &tx.asset else {
            return Err(TxError::InvalidUsername(String::new()));
        };
        if !valid_username(username) {
            return Err(TxError::InvalidUsername(username.clone()));
        }
        if sender.is_delegate {
            return Err(TxError::AlreadyDelegate(sender.address));
        }
        let taken = store
            .delegate_by_username(username)
            .map_err(|e| TxError::Storage(e.to_string()))?;
        if taken.is_some() {
            return Err(TxError::UsernameTaken(username.clone()));
        }
        check_balance(tx.fee, sender.balance, sender.address)
    }

    fn apply(&self, tx: &Transaction, sender: &Account) -> Result<Vec<StorageOp>, TxError> {
        let TxAsset::Delegate { username } = &tx.asset else {
            return Err(TxError::InvalidUsername(String::new()));
        };
        Ok(vec![
            StorageOp::MergeAccount(sender.address, AccountDelta::balance(-debit(tx)?)),
            StorageOp::SetDelegate {
                address: sender.address,
                username: Some(username.clone()),
                is_delegate: true,
            },
        ])
    }

    fn undo(&self, tx: &Transaction, sender: &Account) -> Result<Vec<StorageOp>, TxError> {
        Ok(vec![
            StorageOp::MergeAccount(sender.address, AccountDelta::balance(debit(tx)?)),
            StorageOp::SetDelegate {
                address: sender.address,
                username: None,
                is_delegate: false,
            },
        ])
    }

    fn apply_unconfirmed(
        &self,
        tx: &Transaction,
        sender: &Account,
    ) -> Result<Vec<StorageOp>, TxError> {
        check_balance(tx.fee, sender.unconfirmed_balance, sender.address)?;
        Ok(vec![StorageOp::MergeAccount(
            sender.address,
            AccountDelta::unconfirmed(-debit(tx)?),
        )])
    }

    fn undo_unconfirmed(&self, tx: &Transaction) -> Result<Vec<StorageOp>, TxError> {
        Ok(vec![StorageOp::MergeAccount(
            tx.sender_id(),
            AccountDelta::unconfirmed(debit(tx)?),
        )])
    }

    fn min_bytes_size(&self) -> usize {
        TX_BASE_BYTES + 1
    }

    fn max_bytes_size(&self) -> usize {
        TX_BASE_BYTES + MAX_USERNAME_LEN
    }
}

/// Type 3: vote for / withdraw from delegates.
pub struct VoteHandler;

impl TxHandler for VoteHandler {
    fn verify(
        &self,
        tx: &Transaction,
        sender: &Account,
        store: &dyn Storage,
    ) -> Result<(), TxError> {
        let TxAsset::Votes { added, removed } = &tx.asset else {
            return Err(TxError::TooManyVotes(0));
        };
        if added.len() + removed.len() > MAX_VOTES_PER_TX {
            return Err(TxError::TooManyVotes(added.len() + removed.len()));
        }
        for key in added {
            if sender.votes.contains(key) {
                return Err(TxError::AlreadyVoted(key.to_hex()));
            }
            let target = store
                .account(Address::from_public_key(key))
                .map_err(|e| TxError::Storage(e.to_string()))?;
            if !target.map(|a| a.is_delegate).unwrap_or(false) {
                return Err(TxError::NotADelegate(key.to_hex()));
            }
        }
        for key in removed {
            if !sender.votes.contains(key) {
                return Err(TxError::NotVoted(key.to_hex()));
            }
        }
        check_balance(tx.fee, sender.balance, sender.address)
    }

    fn apply(&self, tx: &Transaction, sender: &Account) -> Result<Vec<StorageOp>, TxError> {
        let TxAsset::Votes { added, removed } = &tx.asset else {
            return Err(TxError::TooManyVotes(0));
        };
        Ok(vec![
            StorageOp::MergeAccount(sender.address, AccountDelta::balance(-debit(tx)?)),
            StorageOp::SetVotes {
                address: sender.address,
                added: added.clone(),
                removed: removed.clone(),
            },
        ])
    }

    fn undo(&self, tx: &Transaction, sender: &Account) -> Result<Vec<StorageOp>, TxError> {
        let TxAsset::Votes { added, removed } = &tx.asset else {
            return Err(TxError::TooManyVotes(0));
        };
        Ok(vec![
            StorageOp::MergeAccount(sender.address, AccountDelta::balance(debit(tx)?)),
            StorageOp::SetVotes {
                address: sender.address,
                added: removed.clone(),
                removed: added.clone(),
            },
        ])
    }

    fn apply_unconfirmed(
        &self,
        tx: &Transaction,
        sender: &Account,
    ) -> Result<Vec<StorageOp>, TxError> {
        check_balance(tx.fee, sender.unconfirmed_balance, sender.address)?;
        Ok(vec![StorageOp::MergeAccount(
            sender.address,
            AccountDelta::unconfirmed(-debit(tx)?),
        )])
    }

    fn undo_unconfirmed(&self, tx: &Transaction) -> Result<Vec<StorageOp>, TxError> {
        Ok(vec![StorageOp::MergeAccount(
            tx.sender_id(),
            AccountDelta::unconfirmed(debit(tx)?),
        )])
    }

    fn min_bytes_size(&self) -> usize {
        TX_BASE_BYTES + 33
    }

    fn max_bytes_size(&self) -> usize {
        TX_BASE_BYTES + 33 * MAX_VOTES_PER_TX
    }
}
