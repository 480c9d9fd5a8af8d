//! Stealth (one-time) receiver addresses.
//!
//! A receiver publishes spend and view public keys `(S, V)`. For each payment
//! the sender draws fresh randomness `r`, publishes `R = r*G`, and pays to
//! `P' = H(r*V)*G + S`. Only the view key holder can detect the payment and
//! only the spend key holder can compute the spending key `H(v*R) + d`.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;

use tumbler_types::ring::StealthAddress;

use crate::curve::{
    basepoint, blake3_hash, hash_to_scalar, point_from_bytes, point_to_bytes, random_scalar,
};
use crate::CryptoError;

const SHARED_SECRET_DOMAIN: &str = "tumbler_stealth_shared";
const ADDRESS_PREFIX: &str = "oxt";

/// Receiver-side key material.
#[derive(Clone)]
pub struct StealthKeys {
    pub spend_secret: Scalar,
    pub view_secret: Scalar,
}

impl StealthKeys {
    pub fn generate() -> Self {
        StealthKeys {
            spend_secret: random_scalar(),
            view_secret: random_scalar(),
        }
    }

    pub fn spend_public(&self) -> EdwardsPoint {
        basepoint() * self.spend_secret
    }

    pub fn view_public(&self) -> EdwardsPoint {
        basepoint() * self.view_secret
    }

    /// Encoded public address handed to senders.
    pub fn address(&self) -> String {
        encode_address(&self.spend_public(), &self.view_public())
    }
}

fn shared_scalar(shared_point: &EdwardsPoint) -> Scalar {
    hash_to_scalar(SHARED_SECRET_DOMAIN, &[&point_to_bytes(shared_point)])
}

/// Sender side: derive a one-time output key for the receiver.
pub fn derive(spend_public: &EdwardsPoint, view_public: &EdwardsPoint) -> StealthAddress {
    let r = random_scalar();
    derive_with_randomness(spend_public, view_public, &r)
}

/// Deterministic variant for callers that manage their own randomness.
pub fn derive_with_randomness(
    spend_public: &EdwardsPoint,
    view_public: &EdwardsPoint,
    r: &Scalar,
) -> StealthAddress {
    let tx_public = basepoint() * r;
    let s = shared_scalar(&(view_public * r));
    let one_time = basepoint() * s + spend_public;
    StealthAddress {
        spend_public: point_to_bytes(spend_public),
        view_public: point_to_bytes(view_public),
        address: encode_one_time(&one_time),
        tx_public: point_to_bytes(&tx_public),
    }
}

/// Receiver scan: does the output under `tx_public` belong to these keys?
pub fn scan(keys: &StealthKeys, stealth: &StealthAddress) -> Result<bool, CryptoError> {
    let tx_public = point_from_bytes(&stealth.tx_public)?;
    let s = shared_scalar(&(tx_public * keys.view_secret));
    let expected = basepoint() * s + keys.spend_public();
    Ok(encode_one_time(&expected) == stealth.address)
}

/// Receiver spend-key recovery: `x' = H(v*R) + d`.
pub fn recover_spend_key(keys: &StealthKeys, tx_public: &[u8; 32]) -> Result<Scalar, CryptoError> {
    let tx_public = point_from_bytes(tx_public)?;
    let s = shared_scalar(&(tx_public * keys.view_secret));
    Ok(s + keys.spend_secret)
}

/// Encode a receiver's `(S, V)` pair: prefix, keys, 4-byte checksum,
/// hex-armored.
pub fn encode_address(spend_public: &EdwardsPoint, view_public: &EdwardsPoint) -> String {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(&point_to_bytes(spend_public));
    payload.extend_from_slice(&point_to_bytes(view_public));
    let checksum = blake3_hash(&payload);
    payload.extend_from_slice(&checksum[..4]);
    format!("{}{}", ADDRESS_PREFIX, hex::encode(payload))
}

/// Parse an encoded receiver address back into `(S, V)`.
pub fn decode_address(address: &str) -> Result<(EdwardsPoint, EdwardsPoint), CryptoError> {
    let hex_part = address
        .strip_prefix(ADDRESS_PREFIX)
        .ok_or_else(|| CryptoError::MalformedAddress("missing prefix".into()))?;
    let payload = hex::decode(hex_part)
        .map_err(|_| CryptoError::MalformedAddress("not hex".into()))?;
    if payload.len() != 68 {
        return Err(CryptoError::MalformedAddress("wrong length".into()));
    }
    let checksum = blake3_hash(&payload[..64]);
    if payload[64..] != checksum[..4] {
        return Err(CryptoError::MalformedAddress("checksum mismatch".into()));
    }
    let mut spend = [0u8; 32];
    let mut view = [0u8; 32];
    spend.copy_from_slice(&payload[..32]);
    view.copy_from_slice(&payload[32..64]);
    Ok((point_from_bytes(&spend)?, point_from_bytes(&view)?))
}

fn encode_one_time(one_time: &EdwardsPoint) -> String {
    hex::encode(point_to_bytes(one_time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_detects_own_output() {
        let keys = StealthKeys::generate();
        let stealth = derive(&keys.spend_public(), &keys.view_public());
        assert!(scan(&keys, &stealth).unwrap());
    }

    #[test]
    fn test_scan_rejects_foreign_output() {
        let keys = StealthKeys::generate();
        let other = StealthKeys::generate();
        let stealth = derive(&other.spend_public(), &other.view_public());
        assert!(!scan(&keys, &stealth).unwrap());
    }

    #[test]
    fn test_recovered_key_spends_the_output() {
        let keys = StealthKeys::generate();
        let stealth = derive(&keys.spend_public(), &keys.view_public());
        let spend_key = recover_spend_key(&keys, &stealth.tx_public).unwrap();
        // The recovered scalar's public key must equal the one-time key.
        assert_eq!(encode_one_time(&(basepoint() * spend_key)), stealth.address);
    }

    #[test]
    fn test_two_payments_unlinkable() {
        let keys = StealthKeys::generate();
        let a = derive(&keys.spend_public(), &keys.view_public());
        let b = derive(&keys.spend_public(), &keys.view_public());
        assert_ne!(a.address, b.address);
        assert_ne!(a.tx_public, b.tx_public);
    }

    #[test]
    fn test_address_codec() {
        let keys = StealthKeys::generate();
        let addr = keys.address();
        let (s, v) = decode_address(&addr).unwrap();
        assert_eq!(point_to_bytes(&s), point_to_bytes(&keys.spend_public()));
        assert_eq!(point_to_bytes(&v), point_to_bytes(&keys.view_public()));
        // Corrupt a checksum nibble
        let mut bad = addr.clone();
        let last = bad.pop().unwrap();
        bad.push(if last == '0' { '1' } else { '0' });
        assert!(decode_address(&bad).is_err());
        assert!(decode_address("not_an_address").is_err());
    }
}
