//! Participant signature schemes for CoinJoin: Schnorr (ed25519) and ECDSA
//! (secp256k1), selected by configuration.

use ed25519_dalek::{ExpandedSecretKey, PublicKey, SecretKey, Signature, Verifier};
use secp256k1::{ecdsa, Message, Secp256k1};

use tumbler_types::config::SigAlgorithm;

use crate::curve::sha256;
use crate::CryptoError;

/// Sign `message` with the configured scheme. `secret` is 32 bytes of key
/// material for either curve; ECDSA signs the SHA-256 of the message.
pub fn sign(algo: SigAlgorithm, secret: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match algo {
        SigAlgorithm::Schnorr => schnorr_sign(secret, message),
        SigAlgorithm::Ecdsa => ecdsa_sign(secret, message),
    }
}

/// Verify `signature` over `message` against `public_key` with the
/// configured scheme.
pub fn verify(algo: SigAlgorithm, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match algo {
        SigAlgorithm::Schnorr => schnorr_verify(public_key, message, signature),
        SigAlgorithm::Ecdsa => ecdsa_verify(public_key, message, signature),
    }
}

/// Derive the public key for a 32-byte secret under the given scheme.
pub fn public_key_for(algo: SigAlgorithm, secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match algo {
        SigAlgorithm::Schnorr => {
            let sk = SecretKey::from_bytes(secret)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            Ok(PublicKey::from(&sk).to_bytes().to_vec())
        }
        SigAlgorithm::Ecdsa => {
            let sk = secp256k1::SecretKey::from_slice(secret)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let secp = Secp256k1::new();
            Ok(secp256k1::PublicKey::from_secret_key(&secp, &sk)
                .serialize()
                .to_vec())
        }
    }
}

fn schnorr_sign(secret: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sk = SecretKey::from_bytes(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let public = PublicKey::from(&sk);
    let expanded = ExpandedSecretKey::from(&sk);
    Ok(expanded.sign(message, &public).to_bytes().to_vec())
}

fn schnorr_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let public = match PublicKey::from_bytes(public_key) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let sig = match Signature::from_bytes(signature) {
        Ok(s) => s,
        Err(_) => return false,
    };
    public.verify(message, &sig).is_ok()
}

fn ecdsa_sign(secret: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sk = secp256k1::SecretKey::from_slice(secret)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let digest = sha256(message);
    let msg = Message::from_digest_slice(&digest)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let secp = Secp256k1::new();
    Ok(secp.sign_ecdsa(&msg, &sk).serialize_compact().to_vec())
}

fn ecdsa_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let secp = Secp256k1::new();
    let pk = match secp256k1::PublicKey::from_slice(public_key) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let sig = match ecdsa::Signature::from_compact(signature) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let digest = sha256(message);
    let msg = match Message::from_digest_slice(&digest) {
        Ok(m) => m,
        Err(_) => return false,
    };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}
