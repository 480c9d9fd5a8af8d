//! Cryptographic primitives for the Oxide Tumbler mixing engine.

pub mod clsag;
pub mod commitment;
pub mod curve;
pub mod keys;
pub mod range_proof;
pub mod signature;
pub mod stealth;

use thiserror::Error;

pub use clsag::ClsagError;
pub use commitment::PedersenGens;
pub use keys::SpendKeyPair;
pub use range_proof::{RangeProof, RangeProofError};

/// Errors from the primitive layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CryptoError {
    #[error("byte string is not a valid curve point")]
    InvalidPoint,

    #[error("byte string is not a canonical scalar")]
    InvalidScalar,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature rejected: {0}")]
    InvalidSignature(String),

    #[error("malformed stealth address: {0}")]
    MalformedAddress(String),
}
