//! Spend key pairs and key images.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;

use crate::curve::{basepoint, hash_to_point, point_to_bytes, random_scalar};

/// An edwards25519 spend key pair used for ring membership. Only ever
/// instantiated for session-local keys; vaulted keys stay behind a
/// `KeyHandle` and the secret store computes their images.
#[derive(Clone)]
pub struct SpendKeyPair {
    pub secret: Scalar,
    pub public: EdwardsPoint,
}

impl SpendKeyPair {
    pub fn generate() -> Self {
        let secret = random_scalar();
        SpendKeyPair {
            secret,
            public: basepoint() * secret,
        }
    }

    pub fn from_secret(secret: Scalar) -> Self {
        SpendKeyPair {
            secret,
            public: basepoint() * secret,
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        point_to_bytes(&self.public)
    }

    /// Key image `I = x * H_p(P)`. Spends of the same key always map to the
    /// same image, which is what makes double spends linkable.
    pub fn key_image(&self) -> EdwardsPoint {
        compute_key_image(&self.secret, &self.public)
    }
}

/// Key image for an explicit key pair.
pub fn compute_key_image(secret: &Scalar, public: &EdwardsPoint) -> EdwardsPoint {
    hash_to_point(&point_to_bytes(public)) * secret
}

/// The scalar/point pair underlying an ed25519 seed, for vaulted signing
/// keys that double as ring spend keys. Uses the clamped expanded scalar, so
/// the pair's public key matches the seed's ed25519 verification key.
pub fn spend_pair_from_seed(seed: &[u8; 32]) -> Result<SpendKeyPair, crate::CryptoError> {
    let sk = ed25519_dalek::SecretKey::from_bytes(seed)
        .map_err(|e| crate::CryptoError::InvalidKey(e.to_string()))?;
    let expanded = ed25519_dalek::ExpandedSecretKey::from(&sk);
    let mut scalar_bytes = [0u8; 32];
    scalar_bytes.copy_from_slice(&expanded.to_bytes()[..32]);
    let secret = Scalar::from_bits(scalar_bytes);
    Ok(SpendKeyPair {
        secret,
        public: basepoint() * secret,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_image_deterministic_and_distinct() {
        let a = SpendKeyPair::generate();
        let b = SpendKeyPair::generate();
        assert_eq!(
            point_to_bytes(&a.key_image()),
            point_to_bytes(&compute_key_image(&a.secret, &a.public))
        );
        assert_ne!(point_to_bytes(&a.key_image()), point_to_bytes(&b.key_image()));
    }

    #[test]
    fn test_key_image_not_linkable_to_public() {
        // The image lives on a different base than the public key.
        let kp = SpendKeyPair::generate();
        assert_ne!(point_to_bytes(&kp.key_image()), kp.public_bytes());
    }
}
