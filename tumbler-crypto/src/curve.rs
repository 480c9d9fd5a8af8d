//! Curve helpers over edwards25519.
//!
//! All scalar arithmetic goes through `curve25519_dalek::Scalar`, which is
//! reduced mod the group order by construction; raw 32-byte arithmetic never
//! appears above this module.

use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::CryptoError;

/// The ed25519 basepoint `G`.
pub fn basepoint() -> EdwardsPoint {
    ED25519_BASEPOINT_POINT
}

/// Domain-separated hash to a scalar.
pub fn hash_to_scalar(domain: &str, chunks: &[&[u8]]) -> Scalar {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain.as_bytes());
    for chunk in chunks {
        hasher.update(chunk);
    }
    Scalar::from_bytes_mod_order(*hasher.finalize().as_bytes())
}

/// Hash arbitrary bytes to a torsion-free curve point (`H_p`).
///
/// Try-and-increment: interpret the SHA-256 of the input as a compressed
/// point; on decompression failure, re-hash until one sticks. The cofactor
/// multiplication clears the torsion component.
pub fn hash_to_point(data: &[u8]) -> EdwardsPoint {
    let mut candidate: [u8; 32] = Sha256::digest(data).into();
    loop {
        if let Some(point) = CompressedEdwardsY(candidate).decompress() {
            let cleared = point.mul_by_cofactor();
            if !cleared.is_identity() {
                return cleared;
            }
        }
        candidate = Sha256::digest(candidate).into();
    }
}

/// Fresh uniformly random scalar from the OS CSPRNG.
pub fn random_scalar() -> Scalar {
    Scalar::random(&mut OsRng)
}

/// Parse a canonical scalar; non-canonical encodings are rejected rather
/// than silently reduced.
pub fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    Scalar::from_canonical_bytes(*bytes).ok_or(CryptoError::InvalidScalar)
}

/// Decompress a point, rejecting invalid encodings.
pub fn point_from_bytes(bytes: &[u8; 32]) -> Result<EdwardsPoint, CryptoError> {
    CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or(CryptoError::InvalidPoint)
}

pub fn point_to_bytes(point: &EdwardsPoint) -> [u8; 32] {
    point.compress().to_bytes()
}

/// SHA-256 of input data. Used where the wire format pins SHA-256
/// specifically (CoinJoin transaction digests).
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// blake3 of input data, the workspace's general-purpose hash.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_sha256_fixture() {
        assert_eq!(
            sha256(b"hello"),
            hex!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[test]
    fn test_hash_to_point_torsion_free() {
        let p = hash_to_point(b"some key bytes");
        assert!(p.is_torsion_free());
        assert!(!p.is_identity());
        // Deterministic
        assert_eq!(point_to_bytes(&p), point_to_bytes(&hash_to_point(b"some key bytes")));
        assert_ne!(point_to_bytes(&p), point_to_bytes(&hash_to_point(b"other key bytes")));
    }

    #[test]
    fn test_hash_to_scalar_domain_separation() {
        let a = hash_to_scalar("domain_a", &[b"payload"]);
        let b = hash_to_scalar("domain_b", &[b"payload"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_scalar_round_trip() {
        let s = random_scalar();
        let parsed = scalar_from_bytes(&s.to_bytes()).unwrap();
        assert_eq!(s, parsed);
    }

    #[test]
    fn test_point_round_trip() {
        let p = hash_to_point(b"round trip");
        let parsed = point_from_bytes(&point_to_bytes(&p)).unwrap();
        assert_eq!(p, parsed);
        // An all-0xFF string is not a valid encoding
        assert!(point_from_bytes(&[0xFF; 32]).is_err());
    }
}
