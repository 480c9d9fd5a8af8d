//! Borromean-style range proofs over Pedersen commitments.
//!
//! Proves that a commitment `C = a*G + v*H` opens to a value in `[0, 2^64)`
//! without revealing it: the value is decomposed into 64 bit commitments
//! `C_i = a_i*G + b_i*2^i*H`, each carrying a two-branch ring proof that its
//! bit is 0 or 1, with `sum(C_i) == C` tying the bits to the amount.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commitment::PedersenGens;
use crate::curve::{
    basepoint, hash_to_scalar, point_from_bytes, point_to_bytes, random_scalar, scalar_from_bytes,
};

const BITS: usize = 64;
const RING_DOMAIN: &str = "tumbler_range_bit_ring";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RangeProofError {
    #[error("proof bytes are malformed")]
    Malformed,

    #[error("proof covers {0} bits, expected 64")]
    WrongBitCount(usize),

    #[error("bit commitments do not sum to the amount commitment")]
    SumMismatch,

    #[error("ring proof for bit {0} failed")]
    BitProofFailed(usize),

    #[error("proof contains an invalid curve point or scalar")]
    InvalidElement,
}

/// Two-branch ring proof that one bit commitment hides 0 or 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BitProof {
    commitment: [u8; 32],
    e0: [u8; 32],
    s0: [u8; 32],
    s1: [u8; 32],
}

/// A complete 64-bit range proof.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeProof {
    bits: Vec<BitProof>,
}

fn ring_challenge(context: &[u8], point: &EdwardsPoint) -> Scalar {
    hash_to_scalar(RING_DOMAIN, &[context, &point_to_bytes(point)])
}

fn bit_context(aggregate: &[u8; 32], index: usize, bit_commitment: &[u8; 32]) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(72);
    ctx.extend_from_slice(aggregate);
    ctx.extend_from_slice(&(index as u64).to_le_bytes());
    ctx.extend_from_slice(bit_commitment);
    ctx
}

impl RangeProof {
    /// Prove that `commit(value, blinding)` lies in `[0, 2^64)`.
    pub fn prove(gens: &PedersenGens, value: u64, blinding: &Scalar) -> RangeProof {
        let aggregate = gens.commit_bytes(value, blinding);

        // Split the blinding across the bits; the last absorbs the remainder
        // so the bit commitments sum to the aggregate.
        let mut bit_blindings: Vec<Scalar> = (0..BITS - 1).map(|_| random_scalar()).collect();
        let partial: Scalar = bit_blindings.iter().sum();
        bit_blindings.push(blinding - partial);

        let mut bits = Vec::with_capacity(BITS);
        for i in 0..BITS {
            let bit = (value >> i) & 1;
            let a = bit_blindings[i];
            let weight = gens.h * Scalar::from(1u64 << i);
            let c_bit = basepoint() * a
                + if bit == 1 { weight } else { EdwardsPoint::identity() };
            let c_bit_bytes = point_to_bytes(&c_bit);
            let ctx = bit_context(&aggregate, i, &c_bit_bytes);

            // Branch 0 key is C_i, branch 1 key is C_i - 2^i*H; we know the
            // discrete log of exactly one of them.
            let branch = [c_bit, c_bit - weight];
            let known = bit as usize;
            let other = 1 - known;

            let alpha = random_scalar();
            let mut e = [Scalar::zero(); 2];
            let mut s = [Scalar::zero(); 2];
            e[other] = ring_challenge(&ctx, &(basepoint() * alpha));
            s[other] = random_scalar();
            e[known] = ring_challenge(&ctx, &(basepoint() * s[other] + branch[other] * e[other]));
            s[known] = alpha - e[known] * a;

            bits.push(BitProof {
                commitment: c_bit_bytes,
                e0: e[0].to_bytes(),
                s0: s[0].to_bytes(),
                s1: s[1].to_bytes(),
            });
        }

        RangeProof { bits }
    }

    /// Verify this proof against an amount commitment.
    pub fn verify(
        &self,
        gens: &PedersenGens,
        commitment: &[u8; 32],
    ) -> Result<(), RangeProofError> {
        if self.bits.len() != BITS {
            return Err(RangeProofError::WrongBitCount(self.bits.len()));
        }

        let aggregate =
            point_from_bytes(commitment).map_err(|_| RangeProofError::InvalidElement)?;

        let mut sum = EdwardsPoint::identity();
        for (i, bit) in self.bits.iter().enumerate() {
            let c_bit =
                point_from_bytes(&bit.commitment).map_err(|_| RangeProofError::InvalidElement)?;
            sum += c_bit;

            let weight = gens.h * Scalar::from(1u64 << i);
            let branch = [c_bit, c_bit - weight];
            let e0 = scalar_from_bytes(&bit.e0).map_err(|_| RangeProofError::InvalidElement)?;
            let s0 = scalar_from_bytes(&bit.s0).map_err(|_| RangeProofError::InvalidElement)?;
            let s1 = scalar_from_bytes(&bit.s1).map_err(|_| RangeProofError::InvalidElement)?;

            let ctx = bit_context(commitment, i, &bit.commitment);
            let e1 = ring_challenge(&ctx, &(basepoint() * s0 + branch[0] * e0));
            let e0_check = ring_challenge(&ctx, &(basepoint() * s1 + branch[1] * e1));
            if e0_check != e0 {
                return Err(RangeProofError::BitProofFailed(i));
            }
        }

        if sum != aggregate {
            return Err(RangeProofError::SumMismatch);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<RangeProof, RangeProofError> {
        bincode::deserialize(bytes).map_err(|_| RangeProofError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let gens = PedersenGens::default();
        let blinding = random_scalar();
        let commitment = gens.commit_bytes(72_300_000, &blinding);
        let proof = RangeProof::prove(&gens, 72_300_000, &blinding);
        proof.verify(&gens, &commitment).unwrap();
    }

    #[test]
    fn test_zero_and_max() {
        let gens = PedersenGens::default();
        for value in [0u64, u64::MAX] {
            let blinding = random_scalar();
            let commitment = gens.commit_bytes(value, &blinding);
            let proof = RangeProof::prove(&gens, value, &blinding);
            proof.verify(&gens, &commitment).unwrap();
        }
    }

    #[test]
    fn test_wrong_commitment_rejected() {
        let gens = PedersenGens::default();
        let blinding = random_scalar();
        let proof = RangeProof::prove(&gens, 1000, &blinding);
        let other = gens.commit_bytes(1001, &blinding);
        assert!(proof.verify(&gens, &other).is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let gens = PedersenGens::default();
        let blinding = random_scalar();
        let commitment = gens.commit_bytes(42, &blinding);
        let proof = RangeProof::prove(&gens, 42, &blinding);
        let bytes = proof.to_bytes();
        assert!(bytes.len() >= 32);
        let restored = RangeProof::from_bytes(&bytes).unwrap();
        restored.verify(&gens, &commitment).unwrap();
        assert!(RangeProof::from_bytes(&bytes[..10]).is_err());
    }
}
