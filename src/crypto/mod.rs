//! Key management and hashing for block and transaction identities.
//!
//! Generators and senders are identified by 32-byte ed25519 public keys and
//! sign with 64-byte detached signatures. All protocol hashes are SHA-256;
//! block and transaction ids are derived from those digests.

use ed25519_dalek::{Signer, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Hash;

/// Expected signature length, for serde validation.
pub const SIGNATURE_BYTES: usize = 64;
/// Expected public key length.
pub const PUBLIC_KEY_BYTES: usize = 32;

/// Errors from key parsing and signing.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid secret seed: expected 32 bytes, got {0}")]
    InvalidSeed(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// Compute the SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-256 digest of concatenated slices without an
/// intermediate allocation.
pub fn sha256_parts(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derive the numeric entity id from a SHA-256 digest: the last 8 bytes,
/// byte-reversed, as a u64. Block and transaction ids both use this; any
/// change to it changes every id on the chain.
pub fn numeric_id(digest: &Hash) -> u64 {
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[24..32]);
    tail.reverse();
    u64::from_be_bytes(tail)
}

/// An ed25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_BYTES]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        let arr: [u8; PUBLIC_KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey(format!("bad length for {s}")))?;
        Ok(PublicKey(arr))
    }

    /// Verify a detached signature over `msg`.
    ///
    /// Returns false for malformed keys or signatures rather than erroring:
    /// a peer-supplied key that is not a valid curve point simply fails
    /// verification.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_BYTES]>::try_from(signature.as_bytes()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(msg, &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..8])
    }
}

/// A detached ed25519 signature.
///
/// Stored as a `Vec<u8>` with length-validating serde: either empty (an
/// unsigned block under construction) or exactly 64 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// An empty placeholder signature for blocks not yet signed.
    pub fn empty() -> Self {
        Signature(vec![])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "Signature(empty)")
        } else {
            write!(f, "Signature({})", &self.to_hex()[..8])
        }
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if !bytes.is_empty() && bytes.len() != SIGNATURE_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid signature: expected {} bytes, got {}",
                SIGNATURE_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// An ed25519 signing keypair.
///
/// Derived deterministically from a 32-byte seed so forging identities can
/// be reconstructed from a configured secret.
#[derive(Clone)]
pub struct Keypair {
    signing: ed25519_dalek::SigningKey,
    pub public: PublicKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let signing = ed25519_dalek::SigningKey::generate(&mut rng);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Keypair { signing, public }
    }

    /// Derive a keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = ed25519_dalek::SigningKey::from_bytes(seed);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Keypair { signing, public }
    }

    /// Derive a keypair from an arbitrary secret passphrase (seed = SHA-256
    /// of the passphrase), the way forging secrets are configured.
    pub fn from_secret(secret: &str) -> Self {
        Self::from_seed(&sha256(secret.as_bytes()))
    }

    /// Sign a message, returning a 64-byte detached signature.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.signing.sign(msg).to_bytes().to_vec())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", &self.public.to_hex()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"meridian");
        assert!(kp.public.verify(b"meridian", &sig));
        assert!(!kp.public.verify(b"tampered", &sig));
    }

    #[test]
    fn keypair_from_secret_is_deterministic() {
        let a = Keypair::from_secret("drift anchor harbor");
        let b = Keypair::from_secret("drift anchor harbor");
        assert_eq!(a.public, b.public);
        assert_eq!(a.sign(b"msg").as_bytes(), b.sign(b"msg").as_bytes());
    }

    #[test]
    fn signature_serde_rejects_bad_length() {
        let bytes = crate::serialize(&vec![1u8; 17]).unwrap();
        assert!(crate::deserialize::<Signature>(&bytes).is_err());
    }

    #[test]
    fn signature_serde_accepts_empty_and_full() {
        for sig in [Signature::empty(), Signature(vec![7u8; 64])] {
            let bytes = crate::serialize(&sig).unwrap();
            let back: Signature = crate::deserialize(&bytes).unwrap();
            assert_eq!(sig, back);
        }
    }

    #[test]
    fn verify_rejects_garbage_key() {
        let pk = PublicKey([0xff; 32]);
        let sig = Signature(vec![0u8; 64]);
        assert!(!pk.verify(b"msg", &sig));
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(sha256_parts(&[b"ab", b"c"]), sha256(b"abc"));
    }
}
