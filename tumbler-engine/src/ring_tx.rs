//! Ring transaction assembly and verification.
//!
//! A ring transaction spends N inputs, each hidden in its own ring behind a
//! CLSAG signature, into M stealth-addressed outputs. In transparent mode
//! amounts balance exactly; in confidential mode each output carries a
//! Pedersen commitment with a range proof and the commitments balance.

use std::sync::Arc;

use curve25519_dalek::scalar::Scalar;
use log::{debug, info};

use tumbler_crypto::commitment::PedersenGens;
use tumbler_crypto::curve::{random_scalar, scalar_from_bytes};
use tumbler_crypto::range_proof::RangeProof;
use tumbler_crypto::{clsag, stealth};

use tumbler_types::amount::Amount;
use tumbler_types::config::RingConfig;
use tumbler_types::currency::Currency;
use tumbler_types::ring::{ConfidentialAmount, RingKey, RingSignature, StealthAddress};

use crate::decoy::DecoySelector;
use crate::registry::KeyImageRegistry;
use crate::traits::{BlockchainAdapter, Repository};
use crate::EngineError;

/// One signed input of a ring transaction.
#[derive(Debug, Clone)]
pub struct RingTxInput {
    /// Compressed public keys, real key hidden among decoys.
    pub ring: Vec<[u8; 32]>,
    pub signature: RingSignature,
    pub amount: Amount,
    /// Pedersen commitment to the input amount, present when
    /// confidential-transactions mode is on. Bound into the CLSAG.
    pub commitment: Option<[u8; 32]>,
}

/// One output of a ring transaction.
#[derive(Debug, Clone)]
pub struct RingTxOutput {
    pub stealth: StealthAddress,
    pub amount: Amount,
    /// Present when confidential-transactions mode is on.
    pub confidential: Option<ConfidentialAmount>,
}

/// A fully built ring transaction.
#[derive(Debug, Clone)]
pub struct RingTransaction {
    pub currency: Currency,
    pub inputs: Vec<RingTxInput>,
    pub outputs: Vec<RingTxOutput>,
    pub fee: Amount,
}

/// A spend the builder is asked to make: the real key (with its session
/// private key) plus the destination set is supplied by the caller.
pub struct SpendRequest {
    pub currency: Currency,
    pub inputs: Vec<RingKey>,
    /// `(receiver stealth address, amount)` pairs.
    pub payments: Vec<(String, Amount)>,
    pub fee: Amount,
}

/// Builds and verifies ring transactions.
pub struct RingTransactionBuilder {
    config: RingConfig,
    selector: DecoySelector,
    gens: PedersenGens,
    repository: Arc<dyn Repository>,
    adapter: Arc<dyn BlockchainAdapter>,
    registry: Arc<KeyImageRegistry>,
}

impl RingTransactionBuilder {
    pub fn new(
        config: RingConfig,
        repository: Arc<dyn Repository>,
        adapter: Arc<dyn BlockchainAdapter>,
        registry: Arc<KeyImageRegistry>,
    ) -> Self {
        RingTransactionBuilder {
            selector: DecoySelector::new(config.clone()),
            gens: PedersenGens::default(),
            config,
            repository,
            adapter,
            registry,
        }
    }

    /// Build a ring transaction. Fails fast with `DoubleSpend` if any input's
    /// key image is already registered; the registry itself is only written
    /// by verification.
    pub async fn build(&self, spend: SpendRequest) -> Result<RingTransaction, EngineError> {
        if spend.inputs.is_empty() || spend.payments.is_empty() {
            return Err(EngineError::Internal("empty spend request".into()));
        }
        let total_in: Amount = spend.inputs.iter().map(|k| k.metadata.amount).sum();
        let total_out: Amount = spend.payments.iter().map(|(_, a)| *a).sum();
        if total_in != total_out + spend.fee {
            return Err(EngineError::Internal(format!(
                "unbalanced spend: {} in, {} out + {} fee",
                total_in, total_out, spend.fee
            )));
        }

        let current_height = self.adapter.block_height(spend.currency).await?;
        let candidates = self
            .repository
            .decoy_candidates(spend.currency, 0, u64::MAX)
            .await?;

        // Outputs first: the signed message must commit to them.
        let confidential = self.config.confidential_transactions;
        let mut outputs = Vec::with_capacity(spend.payments.len());
        let mut output_blindings: Vec<Scalar> = Vec::new();
        for (address, amount) in &spend.payments {
            let one_time = if self.config.stealth_addresses {
                let (spend_pub, view_pub) = stealth::decode_address(address)?;
                stealth::derive(&spend_pub, &view_pub)
            } else {
                // Transparent output: the recipient address is used verbatim.
                StealthAddress {
                    spend_public: [0u8; 32],
                    view_public: [0u8; 32],
                    address: address.clone(),
                    tx_public: [0u8; 32],
                }
            };
            let conf = if confidential {
                let blinding = random_scalar();
                let commitment = self.gens.commit_bytes(*amount, &blinding);
                let proof = RangeProof::prove(&self.gens, *amount, &blinding);
                output_blindings.push(blinding);
                Some(ConfidentialAmount {
                    commitment,
                    range_proof: proof.to_bytes(),
                })
            } else {
                None
            };
            outputs.push(RingTxOutput {
                stealth: one_time,
                amount: *amount,
                confidential: conf,
            });
        }

        let message = transaction_message(&outputs, spend.fee);

        // In confidential mode the input blindings are chosen to sum to the
        // output blindings, so the commitments balance homomorphically with
        // only the fee left in the clear.
        let mut input_blindings: Vec<Scalar> = Vec::new();
        if confidential {
            let out_sum: Scalar = output_blindings.iter().sum();
            for _ in 0..spend.inputs.len() - 1 {
                input_blindings.push(random_scalar());
            }
            let partial: Scalar = input_blindings.iter().sum();
            input_blindings.push(out_sum - partial);
        }

        let mut inputs = Vec::with_capacity(spend.inputs.len());
        for (index, real) in spend.inputs.into_iter().enumerate() {
            let secret_bytes = real
                .private_key
                .ok_or_else(|| EngineError::Internal("spend input without private key".into()))?;
            let secret = scalar_from_bytes(&secret_bytes)?;
            let amount = real.metadata.amount;

            let built = self.selector.build_ring(real, &candidates, current_height)?;
            let ring: Vec<[u8; 32]> = built.members.iter().map(|m| m.public_key).collect();

            let commitment = if confidential {
                Some(self.gens.commit_bytes(amount, &input_blindings[index]))
            } else {
                None
            };
            let signature = clsag::sign(
                &message,
                &ring,
                &secret,
                commitment.as_ref(),
                self.config.min_ring_size,
            )?;

            if self
                .registry
                .contains(spend.currency, &signature.key_image)
                .await?
            {
                return Err(EngineError::DoubleSpend);
            }

            debug!(
                "signed ring input, ring size {}, image {}",
                ring.len(),
                hex::encode(&signature.key_image[..8])
            );
            inputs.push(RingTxInput { ring, signature, amount, commitment });
        }

        info!(
            "built {} ring transaction: {} inputs, {} outputs",
            spend.currency,
            inputs.len(),
            outputs.len()
        );
        Ok(RingTransaction {
            currency: spend.currency,
            inputs,
            outputs,
            fee: spend.fee,
        })
    }

    /// Verify a ring transaction and register its key images. All checks run
    /// before anything is recorded; the images then land in the registry as
    /// one all-or-nothing batch, so a transaction rejected on any input
    /// leaves no trace of the others.
    pub async fn verify(&self, tx: &RingTransaction) -> Result<(), EngineError> {
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(EngineError::ProofFailure("empty transaction".into()));
        }

        let message = transaction_message(&tx.outputs, tx.fee);

        if self.config.confidential_transactions {
            self.verify_confidential(tx)?;
        } else {
            let total_in: Amount = tx.inputs.iter().map(|i| i.amount).sum();
            let total_out: Amount = tx.outputs.iter().map(|o| o.amount).sum();
            if total_in != total_out + tx.fee {
                return Err(EngineError::ProofFailure(format!(
                    "value imbalance: {} in, {} out + {} fee",
                    total_in, total_out, tx.fee
                )));
            }
        }

        let mut images = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            clsag::verify(
                &message,
                &input.signature,
                &input.ring,
                input.commitment.as_ref(),
                self.config.min_ring_size,
            )?;
            images.push(input.signature.key_image);
        }

        // The batch insert is the linearization point; of two racing
        // verifies over the same image exactly one gets past this line.
        self.registry.insert_all(tx.currency, &images).await
    }

    /// Confidential balance: every output commitment carries a valid range
    /// proof and the input commitments equal the output commitments plus the
    /// public fee under the homomorphism. Plaintext amounts play no part.
    fn verify_confidential(&self, tx: &RingTransaction) -> Result<(), EngineError> {
        use tumbler_crypto::curve::point_from_bytes;

        let mut input_points = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let commitment = input
                .commitment
                .as_ref()
                .ok_or_else(|| EngineError::ProofFailure("missing input commitment".into()))?;
            input_points.push(point_from_bytes(commitment)?);
        }

        let mut output_points = Vec::with_capacity(tx.outputs.len());
        for output in &tx.outputs {
            let conf = output
                .confidential
                .as_ref()
                .ok_or_else(|| EngineError::ProofFailure("missing output commitment".into()))?;
            let point = point_from_bytes(&conf.commitment)?;
            let proof = RangeProof::from_bytes(&conf.range_proof)?;
            proof.verify(&self.gens, &conf.commitment)?;
            output_points.push(point);
        }

        if !self.gens.balance(&input_points, &output_points, tx.fee) {
            return Err(EngineError::ProofFailure("commitment imbalance".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::memory::{MemoryChain, MemoryRepository};
    use tumbler_crypto::keys::SpendKeyPair;
    use tumbler_crypto::stealth::StealthKeys;
    use tumbler_types::ring::RingKeyMetadata;

    fn decoy_pool(count: usize, height: u64) -> Vec<RingKey> {
        (0..count)
            .map(|i| RingKey {
                public_key: SpendKeyPair::generate().public_bytes(),
                private_key: None,
                metadata: RingKeyMetadata {
                    amount: 1_000_000,
                    block_height: height + i as u64,
                    tx_hash: [i as u8; 32],
                    output_index: 0,
                },
            })
            .collect()
    }

    fn spend_input(amount: u64) -> RingKey {
        let pair = SpendKeyPair::generate();
        RingKey {
            public_key: pair.public_bytes(),
            private_key: Some(pair.secret.to_bytes()),
            metadata: RingKeyMetadata {
                amount,
                block_height: 99_500,
                tx_hash: [200u8; 32],
                output_index: 0,
            },
        }
    }

    async fn builder(confidential: bool) -> (RingTransactionBuilder, Arc<MemoryRepository>) {
        let repository = MemoryRepository::new();
        repository
            .add_decoy_candidates(Currency::Btc, decoy_pool(40, 99_000))
            .await;
        let registry = Arc::new(KeyImageRegistry::new(repository.clone(), EventBus::default()));
        let config = RingConfig {
            confidential_transactions: confidential,
            ..RingConfig::default()
        };
        let builder =
            RingTransactionBuilder::new(config, repository.clone(), MemoryChain::new(), registry);
        (builder, repository)
    }

    fn payment(amount: u64) -> (String, Amount) {
        (StealthKeys::generate().address(), amount)
    }

    #[tokio::test]
    async fn test_build_verify_round_trip() {
        let (builder, _repo) = builder(false).await;
        let tx = builder
            .build(SpendRequest {
                currency: Currency::Btc,
                inputs: vec![spend_input(1_000_000)],
                payments: vec![payment(990_000)],
                fee: 10_000,
            })
            .await
            .unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].ring.len(), 11);
        builder.verify(&tx).await.unwrap();

        // The registry now holds the key image; replaying is a double spend.
        assert_eq!(builder.verify(&tx).await, Err(EngineError::DoubleSpend));
    }

    #[tokio::test]
    async fn test_unbalanced_spend_rejected() {
        let (builder, _repo) = builder(false).await;
        let result = builder
            .build(SpendRequest {
                currency: Currency::Btc,
                inputs: vec![spend_input(1_000_000)],
                payments: vec![payment(990_000)],
                fee: 20_000,
            })
            .await;
        assert!(matches!(result, Err(EngineError::Internal(_))));
    }

    #[tokio::test]
    async fn test_value_imbalance_rejected_at_verify() {
        let (builder, _repo) = builder(false).await;
        let mut tx = builder
            .build(SpendRequest {
                currency: Currency::Btc,
                inputs: vec![spend_input(1_000_000)],
                payments: vec![payment(990_000)],
                fee: 10_000,
            })
            .await
            .unwrap();
        tx.outputs[0].amount += 1;
        assert!(matches!(
            builder.verify(&tx).await,
            Err(EngineError::ProofFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_confidential_outputs_carry_valid_proofs() {
        let (builder, _repo) = builder(true).await;
        let tx = builder
            .build(SpendRequest {
                currency: Currency::Btc,
                inputs: vec![spend_input(1_000_000)],
                payments: vec![payment(600_000), payment(390_000)],
                fee: 10_000,
            })
            .await
            .unwrap();
        for input in &tx.inputs {
            assert!(input.commitment.is_some());
        }
        for output in &tx.outputs {
            let conf = output.confidential.as_ref().expect("commitment present");
            assert!(conf.range_proof.len() >= 32);
        }
        builder.verify(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_confidential_commitment_imbalance_rejected() {
        let (builder, _repo) = builder(true).await;
        let mut tx = builder
            .build(SpendRequest {
                currency: Currency::Btc,
                inputs: vec![spend_input(1_000_000)],
                payments: vec![payment(990_000)],
                fee: 10_000,
            })
            .await
            .unwrap();

        // Swap in a commitment to a different value with its own perfectly
        // valid range proof. The range check passes; the homomorphic
        // balance must not, whatever the plaintext fields claim.
        let gens = PedersenGens::default();
        let blinding = random_scalar();
        tx.outputs[0].confidential = Some(ConfidentialAmount {
            commitment: gens.commit_bytes(990_001, &blinding),
            range_proof: RangeProof::prove(&gens, 990_001, &blinding).to_bytes(),
        });
        assert!(matches!(
            builder.verify(&tx).await,
            Err(EngineError::ProofFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_transaction_burns_no_images() {
        let (builder, repo) = builder(false).await;
        let tx = builder
            .build(SpendRequest {
                currency: Currency::Btc,
                inputs: vec![spend_input(600_000), spend_input(400_000)],
                payments: vec![payment(990_000)],
                fee: 10_000,
            })
            .await
            .unwrap();

        // Corrupt the SECOND input's signature: the first input passes its
        // ring check before the transaction as a whole is rejected.
        let mut bad = tx.clone();
        bad.inputs[1].signature.s[0][0] ^= 0x01;
        assert!(builder.verify(&bad).await.is_err());
        // Neither image was recorded by the failed attempt, the verified
        // first input's included.
        for input in &tx.inputs {
            assert!(!repo
                .contains_key_image(Currency::Btc, &input.signature.key_image)
                .await
                .unwrap());
        }

        // The intact transaction still verifies afterwards.
        builder.verify(&tx).await.unwrap();
    }
}

/// Message every input signs: blake3 over outputs and fee.
fn transaction_message(outputs: &[RingTxOutput], fee: Amount) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"TUMBLER_RING_TX");
    for output in outputs {
        hasher.update(output.stealth.address.as_bytes());
        hasher.update(&output.stealth.tx_public);
        hasher.update(&output.amount.to_le_bytes());
        if let Some(conf) = &output.confidential {
            hasher.update(&conf.commitment);
        }
    }
    hasher.update(&fee.to_le_bytes());
    hasher.finalize().as_bytes().to_vec()
}
