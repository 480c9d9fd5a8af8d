//! Pedersen commitments for confidential amounts.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;

use crate::curve::{basepoint, hash_to_point, point_to_bytes};

/// Generators for `C = a*G + v*H`. `H` is derived by hashing so that nobody
/// knows its discrete log with respect to `G`.
#[derive(Clone)]
pub struct PedersenGens {
    pub h: EdwardsPoint,
}

impl Default for PedersenGens {
    fn default() -> Self {
        PedersenGens {
            h: hash_to_point(b"tumbler_pedersen_value_generator"),
        }
    }
}

impl PedersenGens {
    /// Commit to `value` under blinding factor `a`.
    pub fn commit(&self, value: u64, blinding: &Scalar) -> EdwardsPoint {
        basepoint() * blinding + self.h * Scalar::from(value)
    }

    pub fn commit_bytes(&self, value: u64, blinding: &Scalar) -> [u8; 32] {
        point_to_bytes(&self.commit(value, blinding))
    }

    /// Check that input commitments balance output commitments plus a public
    /// fee. Holds when amounts balance and the blinding factors sum equally
    /// on both sides.
    pub fn balance(
        &self,
        inputs: &[EdwardsPoint],
        outputs: &[EdwardsPoint],
        fee: u64,
    ) -> bool {
        let in_sum: EdwardsPoint = inputs.iter().sum();
        let out_sum: EdwardsPoint = outputs.iter().sum();
        in_sum == out_sum + self.h * Scalar::from(fee)
    }
}
