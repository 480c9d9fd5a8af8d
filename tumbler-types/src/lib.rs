//! Shared types for the Oxide Tumbler mixing engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod amount;
pub mod coinjoin;
pub mod config;
pub mod currency;
pub mod error;
pub mod mix;
pub mod pool;
pub mod ring;
pub mod schedule;

pub use amount::Amount;
pub use currency::Currency;
pub use error::ValidationError;

/// 32-byte digest, the workspace-wide hash type.
pub type Hash = [u8; 32];

/// Opaque 128-bit identity of a mix request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MixRequestId(pub Uuid);

impl MixRequestId {
    pub fn generate() -> Self {
        MixRequestId(Uuid::new_v4())
    }
}

impl std::fmt::Display for MixRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a scheduled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn generate() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique 256-bit session identifier. Treated as a secret: it is the bearer
/// token a client uses to query its mix request, so it never appears in logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 32]);

impl SessionId {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only the first four bytes; the full id is a bearer secret.
        write!(f, "SessionId({}..)", hex::encode(&self.0[..4]))
    }
}

impl AsRef<[u8]> for SessionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// CoinJoin participant identity, `H(pubkey)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub [u8; 32]);

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ParticipantId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque reference into the secret store. The engine never holds raw key
/// material; it hands this back to the store together with a digest to sign.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle(pub String);

impl std::fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
