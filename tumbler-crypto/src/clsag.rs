//! CLSAG-style linkable ring signatures.
//!
//! A signature over a ring of `n` public keys proves the signer controls one
//! of them without revealing which, and binds a key image `I = x * H_p(P)`
//! that makes a second spend of the same key detectable. Challenges chain
//! around the ring; the response at the real index closes the loop, and
//! verification recomputes the chain from `c[0]` and checks that it closes.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use thiserror::Error;

use tumbler_types::ring::{RingAlgorithm, RingSignature};

use crate::curve::{
    basepoint, hash_to_point, hash_to_scalar, point_from_bytes, point_to_bytes, random_scalar,
    scalar_from_bytes,
};
use crate::keys::compute_key_image;

const CHALLENGE_DOMAIN: &str = "tumbler_clsag_round";
const SIGNATURE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClsagError {
    #[error("ring of {size} is below the minimum of {minimum}")]
    RingTooSmall { size: usize, minimum: usize },

    #[error("ring size {0} exceeds the maximum {1}")]
    RingTooLarge(usize, usize),

    #[error("signer's public key is not in the ring")]
    KeyNotInRing,

    #[error("ring member {0} is not a valid curve point")]
    InvalidRingMember(usize),

    #[error("key image is not a valid curve point")]
    InvalidKeyImage,

    #[error("signature scalars are not canonical")]
    InvalidScalar,

    #[error("signature shape does not match the ring")]
    ShapeMismatch,

    #[error("message hash does not match the signed message")]
    MessageMismatch,

    #[error("ring does not close; signature rejected")]
    VerificationFailed,
}

/// Per-signature transcript prefix: message hash, the whole ring, the key
/// image, and the optional amount commitment. Both signer and verifier must
/// absorb identical bytes.
fn transcript_prefix(
    message_hash: &[u8; 32],
    ring: &[[u8; 32]],
    key_image: &[u8; 32],
    commitment: Option<&[u8; 32]>,
) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(64 + ring.len() * 32 + 32);
    prefix.extend_from_slice(message_hash);
    for member in ring {
        prefix.extend_from_slice(member);
    }
    prefix.extend_from_slice(key_image);
    if let Some(c) = commitment {
        prefix.extend_from_slice(c);
    }
    prefix
}

fn round_challenge(prefix: &[u8], l: &EdwardsPoint, r: &EdwardsPoint) -> Scalar {
    hash_to_scalar(
        CHALLENGE_DOMAIN,
        &[prefix, &point_to_bytes(l), &point_to_bytes(r)],
    )
}

/// Sign `message` with the spend key `secret`, whose public key must appear
/// in `ring`. Returns the serialized signature including the key image.
pub fn sign(
    message: &[u8],
    ring: &[[u8; 32]],
    secret: &Scalar,
    commitment: Option<&[u8; 32]>,
    min_ring_size: usize,
) -> Result<RingSignature, ClsagError> {
    let n = ring.len();
    if n < min_ring_size {
        return Err(ClsagError::RingTooSmall { size: n, minimum: min_ring_size });
    }

    let public = basepoint() * secret;
    let public_bytes = point_to_bytes(&public);
    let real_index = ring
        .iter()
        .position(|member| *member == public_bytes)
        .ok_or(ClsagError::KeyNotInRing)?;

    let mut members = Vec::with_capacity(n);
    let mut hashed_members = Vec::with_capacity(n);
    for (i, member) in ring.iter().enumerate() {
        let point = point_from_bytes(member).map_err(|_| ClsagError::InvalidRingMember(i))?;
        hashed_members.push(hash_to_point(member));
        members.push(point);
    }

    let key_image = compute_key_image(secret, &public);
    let key_image_bytes = point_to_bytes(&key_image);

    let message_hash = *blake3::hash(message).as_bytes();
    let prefix = transcript_prefix(&message_hash, ring, &key_image_bytes, commitment);

    let mut c = vec![Scalar::zero(); n];
    let mut s = vec![Scalar::zero(); n];

    // Open the ring at the real index with a fresh nonce.
    let alpha = random_scalar();
    c[(real_index + 1) % n] = round_challenge(
        &prefix,
        &(basepoint() * alpha),
        &(hashed_members[real_index] * alpha),
    );

    // Walk the decoys, chaining each challenge into the next.
    for offset in 1..n {
        let i = (real_index + offset) % n;
        s[i] = random_scalar();
        let l = basepoint() * s[i] + members[i] * c[i];
        let r = hashed_members[i] * s[i] + key_image * c[i];
        c[(i + 1) % n] = round_challenge(&prefix, &l, &r);
    }

    // Close the loop at the real index.
    s[real_index] = alpha - c[real_index] * secret;

    Ok(RingSignature {
        c: c.iter().map(|x| x.to_bytes()).collect(),
        s: s.iter().map(|x| x.to_bytes()).collect(),
        key_image: key_image_bytes,
        ring_size: n as u32,
        message_hash,
        algorithm: RingAlgorithm::Clsag,
        version: SIGNATURE_VERSION,
    })
}

/// Verify a signature against `message` and `ring`. Pure: the caller is
/// responsible for consulting the key-image registry before and after.
pub fn verify(
    message: &[u8],
    sig: &RingSignature,
    ring: &[[u8; 32]],
    commitment: Option<&[u8; 32]>,
    min_ring_size: usize,
) -> Result<(), ClsagError> {
    let n = ring.len();
    if n < min_ring_size {
        return Err(ClsagError::RingTooSmall { size: n, minimum: min_ring_size });
    }
    if !sig.shape_ok() || sig.ring_size as usize != n {
        return Err(ClsagError::ShapeMismatch);
    }
    if sig.message_hash != *blake3::hash(message).as_bytes() {
        return Err(ClsagError::MessageMismatch);
    }

    let key_image = point_from_bytes(&sig.key_image).map_err(|_| ClsagError::InvalidKeyImage)?;
    if key_image.is_identity() || !key_image.is_torsion_free() {
        return Err(ClsagError::InvalidKeyImage);
    }

    let mut members = Vec::with_capacity(n);
    let mut hashed_members = Vec::with_capacity(n);
    for (i, member) in ring.iter().enumerate() {
        let point = point_from_bytes(member).map_err(|_| ClsagError::InvalidRingMember(i))?;
        hashed_members.push(hash_to_point(member));
        members.push(point);
    }

    let mut c = Vec::with_capacity(n);
    let mut s = Vec::with_capacity(n);
    for i in 0..n {
        c.push(scalar_from_bytes(&sig.c[i]).map_err(|_| ClsagError::InvalidScalar)?);
        s.push(scalar_from_bytes(&sig.s[i]).map_err(|_| ClsagError::InvalidScalar)?);
    }

    let prefix = transcript_prefix(&sig.message_hash, ring, &sig.key_image, commitment);

    // Recompute the challenge chain from c[0]; every link must match the
    // stored array and the last link must land back on c[0].
    let mut current = c[0];
    for i in 0..n {
        let l = basepoint() * s[i] + members[i] * current;
        let r = hashed_members[i] * s[i] + key_image * current;
        let next = round_challenge(&prefix, &l, &r);
        let expected = c[(i + 1) % n];
        if next != expected {
            return Err(ClsagError::VerificationFailed);
        }
        current = next;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SpendKeyPair;

    fn build_ring(size: usize, real_index: usize) -> (Vec<[u8; 32]>, SpendKeyPair) {
        let real = SpendKeyPair::generate();
        let mut ring = Vec::with_capacity(size);
        for i in 0..size {
            if i == real_index {
                ring.push(real.public_bytes());
            } else {
                ring.push(SpendKeyPair::generate().public_bytes());
            }
        }
        (ring, real)
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let (ring, real) = build_ring(11, 7);
        let sig = sign(b"abc", &ring, &real.secret, None, 7).unwrap();
        assert_eq!(sig.ring_size, 11);
        assert_eq!(sig.c.len(), 11);
        assert_eq!(sig.s.len(), 11);
        verify(b"abc", &sig, &ring, None, 7).unwrap();
    }

    #[test]
    fn test_tampered_scalar_rejected() {
        let (ring, real) = build_ring(11, 7);
        let mut sig = sign(b"abc", &ring, &real.secret, None, 7).unwrap();
        sig.s[3][0] ^= 0x01;
        assert!(verify(b"abc", &sig, &ring, None, 7).is_err());
    }

    #[test]
    fn test_wrong_message_rejected() {
        let (ring, real) = build_ring(7, 0);
        let sig = sign(b"abc", &ring, &real.secret, None, 7).unwrap();
        assert_eq!(
            verify(b"abd", &sig, &ring, None, 7),
            Err(ClsagError::MessageMismatch)
        );
    }

    #[test]
    fn test_minimum_ring_size_boundary() {
        // Exactly the minimum signs and verifies.
        let (ring, real) = build_ring(7, 3);
        let sig = sign(b"m", &ring, &real.secret, None, 7).unwrap();
        verify(b"m", &sig, &ring, None, 7).unwrap();

        // One below the minimum fails validation.
        let (small_ring, small_real) = build_ring(6, 2);
        assert_eq!(
            sign(b"m", &small_ring, &small_real.secret, None, 7),
            Err(ClsagError::RingTooSmall { size: 6, minimum: 7 })
        );
    }

    #[test]
    fn test_key_not_in_ring() {
        let (ring, _) = build_ring(7, 0);
        let outsider = SpendKeyPair::generate();
        assert_eq!(
            sign(b"m", &ring, &outsider.secret, None, 7),
            Err(ClsagError::KeyNotInRing)
        );
    }

    #[test]
    fn test_key_image_stable_across_rings() {
        // The same key in two different rings produces the same image:
        // that is the linkability property the registry relies on.
        let real = SpendKeyPair::generate();
        let mut ring_a = vec![real.public_bytes()];
        let mut ring_b = vec![real.public_bytes()];
        for _ in 0..6 {
            ring_a.push(SpendKeyPair::generate().public_bytes());
            ring_b.push(SpendKeyPair::generate().public_bytes());
        }
        let sig_a = sign(b"first", &ring_a, &real.secret, None, 7).unwrap();
        let sig_b = sign(b"second", &ring_b, &real.secret, None, 7).unwrap();
        assert_eq!(sig_a.key_image, sig_b.key_image);
    }

    #[test]
    fn test_commitment_binds() {
        let (ring, real) = build_ring(7, 4);
        let commitment = [9u8; 32];
        let sig = sign(b"m", &ring, &real.secret, Some(&commitment), 7).unwrap();
        verify(b"m", &sig, &ring, Some(&commitment), 7).unwrap();
        let other = [8u8; 32];
        assert!(verify(b"m", &sig, &ring, Some(&other), 7).is_err());
        assert!(verify(b"m", &sig, &ring, None, 7).is_err());
    }
}
