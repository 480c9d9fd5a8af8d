//! Decoy selection for ring construction.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

use tumbler_types::config::{DecoyAlgorithm, RingConfig};
use tumbler_types::ring::RingKey;
use tumbler_types::ValidationError;

use crate::EngineError;

/// Builds rings by mixing the real key among decoys drawn from prior
/// on-chain outputs of the same currency.
pub struct DecoySelector {
    config: RingConfig,
}

/// A ring with the position of the real key.
pub struct BuiltRing {
    pub members: Vec<RingKey>,
    pub real_index: usize,
}

impl DecoySelector {
    pub fn new(config: RingConfig) -> Self {
        DecoySelector { config }
    }

    /// Assemble a ring of `ring_size` members around `real`. `candidates`
    /// are prior outputs; only those whose age in blocks lies within the
    /// configured window are eligible.
    pub fn build_ring(
        &self,
        real: RingKey,
        candidates: &[RingKey],
        current_height: u64,
    ) -> Result<BuiltRing, EngineError> {
        let n = self.config.ring_size.min(self.config.max_ring_size);
        let decoys_needed = n - 1;

        let eligible: Vec<&RingKey> = candidates
            .iter()
            .filter(|c| {
                let age = current_height.saturating_sub(c.metadata.block_height);
                c.public_key != real.public_key
                    && age >= self.config.minimum_age
                    && age <= self.config.maximum_age
            })
            .collect();

        if eligible.len() < decoys_needed {
            return Err(EngineError::Validation(ValidationError::RingTooSmall {
                size: eligible.len() + 1,
                minimum: n,
            }));
        }

        let mut taken = vec![false; eligible.len()];
        let mut decoys: Vec<RingKey> = Vec::with_capacity(decoys_needed);
        while decoys.len() < decoys_needed {
            let idx = self.draw_index(&eligible, &taken, current_height);
            if !taken[idx] {
                taken[idx] = true;
                let mut decoy = eligible[idx].clone();
                // Decoys never own a private key, whatever the source said.
                decoy.private_key = None;
                decoys.push(decoy);
            }
        }

        // Place the real key at a CSPRNG-chosen index.
        let mut bytes = [0u8; 4];
        OsRng.fill_bytes(&mut bytes);
        let real_index = (u32::from_le_bytes(bytes) as usize) % n;

        let mut members = decoys;
        members.insert(real_index, real);

        Ok(BuiltRing { members, real_index })
    }

    /// Draw one candidate index under the configured age distribution.
    fn draw_index(&self, eligible: &[&RingKey], taken: &[bool], current_height: u64) -> usize {
        let mut rng = OsRng;
        match self.config.decoy_selection_algorithm {
            DecoyAlgorithm::Uniform => rng.gen_range(0..eligible.len()),
            DecoyAlgorithm::Triangular => {
                let u1: f64 = rng.gen();
                let u2: f64 = rng.gen();
                let target = u1.min(u2) * self.config.maximum_age as f64
                    + self.config.minimum_age as f64;
                self.nearest_by_age(eligible, taken, current_height, target)
            }
            DecoyAlgorithm::Gamma => {
                let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
                let u2: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
                // Gamma(2, 1) as the sum of two unit exponentials.
                let gamma = -u1.ln() - u2.ln();
                let target = gamma * 100.0 + self.config.minimum_age as f64;
                self.nearest_by_age(eligible, taken, current_height, target)
            }
        }
    }

    /// Untaken candidate whose age is closest to `target`.
    fn nearest_by_age(
        &self,
        eligible: &[&RingKey],
        taken: &[bool],
        current_height: u64,
        target: f64,
    ) -> usize {
        let mut best = 0;
        let mut best_dist = f64::MAX;
        for (i, candidate) in eligible.iter().enumerate() {
            if taken[i] {
                continue;
            }
            let age = current_height.saturating_sub(candidate.metadata.block_height) as f64;
            let dist = (age - target).abs();
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tumbler_types::ring::RingKeyMetadata;

    fn candidate(tag: u8, block_height: u64) -> RingKey {
        RingKey {
            public_key: [tag; 32],
            private_key: None,
            metadata: RingKeyMetadata {
                amount: 1_000_000,
                block_height,
                tx_hash: [tag; 32],
                output_index: 0,
            },
        }
    }

    fn real_key() -> RingKey {
        RingKey {
            public_key: [200u8; 32],
            private_key: Some([7u8; 32]),
            metadata: RingKeyMetadata {
                amount: 1_000_000,
                block_height: 900,
                tx_hash: [200u8; 32],
                output_index: 0,
            },
        }
    }

    fn config(algorithm: DecoyAlgorithm) -> RingConfig {
        RingConfig {
            ring_size: 11,
            min_ring_size: 7,
            decoy_selection_algorithm: algorithm,
            minimum_age: 10,
            maximum_age: 1000,
            ..RingConfig::default()
        }
    }

    #[test]
    fn test_ring_shape_and_real_placement() {
        for algorithm in [DecoyAlgorithm::Uniform, DecoyAlgorithm::Triangular, DecoyAlgorithm::Gamma] {
            let selector = DecoySelector::new(config(algorithm));
            let candidates: Vec<RingKey> = (0..40).map(|i| candidate(i, 100 + i as u64 * 20)).collect();
            let ring = selector.build_ring(real_key(), &candidates, 1000).unwrap();
            assert_eq!(ring.members.len(), 11);
            assert_eq!(ring.members[ring.real_index].public_key, [200u8; 32]);
            // All decoys distinct and stripped of private keys
            for (i, member) in ring.members.iter().enumerate() {
                if i != ring.real_index {
                    assert!(member.private_key.is_none());
                }
            }
            let mut keys: Vec<[u8; 32]> = ring.members.iter().map(|m| m.public_key).collect();
            keys.sort();
            keys.dedup();
            assert_eq!(keys.len(), 11);
        }
    }

    #[test]
    fn test_age_window_enforced() {
        let selector = DecoySelector::new(config(DecoyAlgorithm::Uniform));
        // Only 5 candidates inside the window; too few for 10 decoys.
        let mut candidates: Vec<RingKey> = (0..5).map(|i| candidate(i, 500)).collect();
        // These are too young (age < 10) and must not count.
        candidates.extend((10..30).map(|i| candidate(i, 995)));
        let result = selector.build_ring(real_key(), &candidates, 1000);
        assert!(matches!(
            result,
            Err(EngineError::Validation(ValidationError::RingTooSmall { .. }))
        ));
    }
}
