//! Ring signature and stealth address wire types.
//!
//! These are the serialized forms shared between the crypto layer and the
//! engine; scalar/point arithmetic happens in `tumbler-crypto`, which
//! converts to and from the byte representations here.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::Hash;

/// A member of a ring. Decoys never carry a private key; the real key may
/// carry one when the key is session-local rather than vaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingKey {
    /// Compressed curve point.
    pub public_key: [u8; 32],
    pub private_key: Option<[u8; 32]>,
    pub metadata: RingKeyMetadata,
}

/// On-chain provenance of a ring member, used for decoy-age selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingKeyMetadata {
    pub amount: Amount,
    pub block_height: u64,
    pub tx_hash: Hash,
    pub output_index: u32,
}

/// Which ring signature construction produced a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingAlgorithm {
    Clsag,
    Borromean,
    Mlsag,
}

/// Serialized linkable ring signature: `ring_size` challenge scalars,
/// `ring_size` response scalars, and the key image that makes double spends
/// of the real key detectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSignature {
    pub c: Vec<[u8; 32]>,
    pub s: Vec<[u8; 32]>,
    pub key_image: [u8; 32],
    pub ring_size: u32,
    pub message_hash: Hash,
    pub algorithm: RingAlgorithm,
    pub version: u8,
}

impl RingSignature {
    /// Structural sanity: both scalar vectors match the declared ring size.
    pub fn shape_ok(&self) -> bool {
        self.c.len() == self.ring_size as usize && self.s.len() == self.ring_size as usize
    }
}

/// A one-time receiver address. Only the holder of the matching view key can
/// detect it; only the holder of the spend key can spend it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealthAddress {
    /// Receiver spend public key `S`.
    pub spend_public: [u8; 32],
    /// Receiver view public key `V`.
    pub view_public: [u8; 32],
    /// Encoded form handed to senders.
    pub address: String,
    /// Ephemeral transaction key `R = r*G` published by the sender.
    pub tx_public: [u8; 32],
}

/// Pedersen commitment plus its range proof, attached to confidential
/// outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialAmount {
    pub commitment: [u8; 32],
    pub range_proof: Vec<u8>,
}
