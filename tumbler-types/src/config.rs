//! Engine configuration.
//!
//! Plain serde structs with sensible `Default` impls so the node binary can
//! persist and reload them as-is.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::currency::Currency;
use crate::schedule::OperationKind;

/// Decoy age distribution used when populating rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoyAlgorithm {
    /// Uniform over the candidate set.
    Uniform,
    /// `min(U1, U2)` age draw, favoring recent outputs.
    Triangular,
    /// `Gamma(2, 1)` age draw, matching observed spend-age curves.
    Gamma,
}

/// Which signature scheme CoinJoin participants sign with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigAlgorithm {
    Schnorr,
    Ecdsa,
}

/// Ring signature and stealth address parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Hard floor on ring size; signatures below it are rejected.
    pub min_ring_size: usize,
    /// Ring size used when signing.
    pub ring_size: usize,
    pub max_ring_size: usize,
    pub decoy_selection_algorithm: DecoyAlgorithm,
    /// Decoy age bounds in blocks.
    pub minimum_age: u64,
    pub maximum_age: u64,
    pub stealth_addresses: bool,
    pub confidential_transactions: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            min_ring_size: 7,
            ring_size: 11,
            max_ring_size: 64,
            decoy_selection_algorithm: DecoyAlgorithm::Gamma,
            minimum_age: 10,
            maximum_age: 100_000,
            stealth_addresses: true,
            confidential_transactions: false,
        }
    }
}

/// CoinJoin coordinator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinJoinConfig {
    pub min_participants: usize,
    pub max_participants: usize,
    /// Registration closes once participants >= min and this long has passed
    /// without a new join.
    pub registration_quiet_period_ms: u64,
    pub registration_timeout_ms: u64,
    pub signing_timeout_ms: u64,
    pub broadcast_timeout_ms: u64,
    /// Broadcast retries before the session fails.
    pub max_broadcast_attempts: u32,
    pub signature_algorithm: SigAlgorithm,
    /// Flat per-round fees in base units of each currency.
    pub coordinator_fee: HashMap<Currency, Amount>,
    pub network_fee: HashMap<Currency, Amount>,
    /// How long completed/failed sessions linger before the cleanup sweep
    /// destroys them.
    pub session_grace_period_ms: u64,
}

impl CoinJoinConfig {
    pub fn coordinator_fee_for(&self, currency: Currency) -> Amount {
        self.coordinator_fee.get(&currency).copied().unwrap_or(0)
    }

    pub fn network_fee_for(&self, currency: Currency) -> Amount {
        self.network_fee.get(&currency).copied().unwrap_or(0)
    }
}

impl Default for CoinJoinConfig {
    fn default() -> Self {
        let mut coordinator_fee = HashMap::new();
        let mut network_fee = HashMap::new();
        for currency in Currency::ALL {
            // 0.1% of the smallest CoinJoin denomination for the coordinator,
            // dust-scale network fee.
            let denom = currency.coinjoin_denominations()[0];
            coordinator_fee.insert(currency, denom / 1000);
            network_fee.insert(currency, currency.dust_limit() * 4);
        }
        Self {
            min_participants: 3,
            max_participants: 50,
            registration_quiet_period_ms: 30_000,
            registration_timeout_ms: 600_000,
            signing_timeout_ms: 120_000,
            broadcast_timeout_ms: 60_000,
            max_broadcast_attempts: 3,
            signature_algorithm: SigAlgorithm::Schnorr,
            coordinator_fee,
            network_fee,
            session_grace_period_ms: 3_600_000,
        }
    }
}

/// Scheduler dispatch and retry parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Floor on retry backoff.
    pub min_delay_secs: u64,
    /// Ceiling on mixing delays.
    pub max_delay_secs: u64,
    pub max_concurrent_operations: usize,
    /// Per-kind in-flight caps.
    pub per_kind_caps: HashMap<OperationKind, usize>,
    pub schedule_check_interval_secs: u64,
    pub execution_pump_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub stats_interval_secs: u64,
    pub max_retry_attempts: u32,
    pub retry_backoff_multiplier: f64,
    /// Operations older than this are cancelled by the cleanup sweep.
    pub operation_ttl_secs: u64,
    /// Uniform jitter ceiling applied to non-CoinJoin schedule times.
    pub max_jitter_secs: u64,
}

impl SchedulerConfig {
    pub fn kind_cap(&self, kind: OperationKind) -> usize {
        self.per_kind_caps
            .get(&kind)
            .copied()
            .unwrap_or(self.max_concurrent_operations)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut per_kind_caps = HashMap::new();
        per_kind_caps.insert(OperationKind::Distribution, 20);
        per_kind_caps.insert(OperationKind::Coinjoin, 15);
        per_kind_caps.insert(OperationKind::Consolidation, 10);
        per_kind_caps.insert(OperationKind::Rebalancing, 5);
        per_kind_caps.insert(OperationKind::Cleanup, 2);
        Self {
            min_delay_secs: 10,
            max_delay_secs: 72 * 3600,
            max_concurrent_operations: 50,
            per_kind_caps,
            schedule_check_interval_secs: 30,
            execution_pump_interval_secs: 5,
            cleanup_interval_secs: 3600,
            stats_interval_secs: 300,
            max_retry_attempts: 5,
            retry_backoff_multiplier: 2.0,
            operation_ttl_secs: 7 * 24 * 3600,
            max_jitter_secs: 60,
        }
    }
}

/// Participant banning policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanConfig {
    pub max_failed_attempts: u32,
    pub ban_duration_secs: u64,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 3,
            ban_duration_secs: 24 * 3600,
        }
    }
}

/// Mix request intake parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixConfig {
    /// Default service fee percentage.
    pub fee_percentage: f64,
    /// How long a request may sit unfunded before it expires.
    pub request_ttl_secs: u64,
    /// Deposit address validity.
    pub deposit_address_ttl_secs: u64,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            fee_percentage: 1.5,
            request_ttl_secs: 24 * 3600,
            deposit_address_ttl_secs: 24 * 3600,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub ring: RingConfig,
    pub coinjoin: CoinJoinConfig,
    pub scheduler: SchedulerConfig,
    pub ban: BanConfig,
    pub mix: MixConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ring.min_ring_size, 7);
        assert_eq!(cfg.ring.ring_size, 11);
        assert_eq!(cfg.ring.max_ring_size, 64);
        assert_eq!(cfg.coinjoin.min_participants, 3);
        assert_eq!(cfg.coinjoin.max_participants, 50);
        assert_eq!(cfg.scheduler.operation_ttl_secs, 7 * 24 * 3600);
        assert_eq!(cfg.scheduler.kind_cap(OperationKind::Distribution), 20);
        assert_eq!(cfg.scheduler.kind_cap(OperationKind::Coinjoin), 15);
        assert_eq!(cfg.scheduler.kind_cap(OperationKind::Rebalancing), 5);
    }
}
