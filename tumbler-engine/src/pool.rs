//! Per-currency liquidity pool.
//!
//! Deposits become pool entries once confirmed; distributions draw on unused
//! entries rather than the depositor's own coins, which is what severs the
//! on-chain link. Selection prefers higher priority, then older entries, and
//! marks winners used in the same repository transaction that records the
//! consuming operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

use tumbler_types::amount::Amount;
use tumbler_types::currency::Currency;
use tumbler_types::pool::{PoolEntry, PoolType, RebalancePlan};
use tumbler_types::schedule::{OperationPayload, ScheduledOperation};
use tumbler_types::{KeyHandle, MixRequestId};

use crate::scheduler::{CancelToken, OperationExecutor};
use crate::traits::{BlockchainAdapter, Repository};
use crate::EngineError;

/// Aggregate pool numbers, per currency.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_entries: usize,
    pub unused_entries: usize,
    pub unused_amount: Amount,
    pub by_type: HashMap<PoolType, Amount>,
}

pub struct PoolManager {
    repository: Arc<dyn Repository>,
    adapter: Arc<dyn BlockchainAdapter>,
    /// Entries below this multiple of the smallest denomination are
    /// consolidation candidates.
    consolidation_threshold_multiple: u64,
}

impl PoolManager {
    pub fn new(repository: Arc<dyn Repository>, adapter: Arc<dyn BlockchainAdapter>) -> Self {
        PoolManager {
            repository,
            adapter,
            consolidation_threshold_multiple: 2,
        }
    }

    /// Add confirmed liquidity to the pool.
    pub async fn add_entry(
        &self,
        currency: Currency,
        amount: Amount,
        source_mix_request_id: MixRequestId,
        source_address: String,
        key_handle: KeyHandle,
        priority: u8,
        pool_type: PoolType,
        ttl_secs: u64,
    ) -> Result<Uuid, EngineError> {
        let entry = PoolEntry {
            id: Uuid::new_v4(),
            currency,
            amount,
            source_mix_request_id,
            source_address,
            key_handle,
            added_at: Utc::now(),
            used: false,
            priority,
            mixing_group_id: None,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs as i64),
            pool_type,
        };
        self.repository.put_pool_entry(&entry).await?;
        info!("pool[{}]: added entry {} of {}", currency, entry.id, amount);
        Ok(entry.id)
    }

    /// Select a minimal set of unused entries covering `amount` and mark
    /// them used transactionally with `op`.
    pub async fn select_distribution_sources(
        &self,
        currency: Currency,
        amount: Amount,
        op: &ScheduledOperation,
    ) -> Result<Vec<PoolEntry>, EngineError> {
        let now = Utc::now();
        let mut entries: Vec<PoolEntry> = self
            .repository
            .pool_entries(currency)
            .await?
            .into_iter()
            .filter(|e| !e.used && e.expires_at > now)
            .collect();

        // Priority 1 beats priority 2; among equals the oldest wins.
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.added_at.cmp(&b.added_at))
        });

        let available: Amount = entries.iter().map(|e| e.amount).sum();
        if available < amount {
            return Err(EngineError::InsufficientLiquidity {
                currency,
                needed: amount,
                available,
            });
        }

        let mut selected: Vec<PoolEntry> = Vec::new();
        let mut covered: Amount = 0;
        for entry in entries {
            if covered >= amount {
                break;
            }
            covered += entry.amount;
            selected.push(entry);
        }

        // Minimality pass: drop any entry whose removal still covers.
        let mut index = 0;
        while index < selected.len() {
            let without = covered - selected[index].amount;
            if without >= amount && selected.len() > 1 {
                covered = without;
                selected.remove(index);
            } else {
                index += 1;
            }
        }

        let ids: Vec<Uuid> = selected.iter().map(|e| e.id).collect();
        self.repository.mark_pool_entries_used(&ids, op).await?;

        // Change handling: the tail entry is consumed only up to the target;
        // its excess returns to the pool as a fresh entry.
        let excess = covered - amount;
        if excess > 0 {
            let last = selected.last_mut().expect("selection is non-empty");
            last.amount -= excess;
            let remainder = PoolEntry {
                id: Uuid::new_v4(),
                amount: excess,
                used: false,
                added_at: Utc::now(),
                ..last.clone()
            };
            self.repository.put_pool_entry(&remainder).await?;
        }
        Ok(selected)
    }

    /// Return unconsumed liquidity to the pool as fresh entries, e.g. after
    /// a partially failed distribution.
    pub async fn return_liquidity(&self, entries: &[PoolEntry]) -> Result<(), EngineError> {
        for entry in entries {
            let reborn = PoolEntry {
                id: Uuid::new_v4(),
                used: false,
                added_at: Utc::now(),
                ..entry.clone()
            };
            self.repository.put_pool_entry(&reborn).await?;
        }
        Ok(())
    }

    /// Merge small unused entries into a single consolidated entry, moving
    /// the funds on-chain to the largest member's address.
    pub async fn consolidate(
        &self,
        currency: Currency,
        max_entries: usize,
        op: &ScheduledOperation,
    ) -> Result<Option<Uuid>, EngineError> {
        let now = Utc::now();
        let threshold =
            currency.denominations()[0] * self.consolidation_threshold_multiple;
        let mut small: Vec<PoolEntry> = self
            .repository
            .pool_entries(currency)
            .await?
            .into_iter()
            .filter(|e| !e.used && e.expires_at > now && e.amount < threshold)
            .collect();
        if small.len() < 2 {
            return Ok(None);
        }
        small.sort_by_key(|e| e.amount);
        small.truncate(max_entries.max(2));

        // The largest member hosts the merged funds.
        let target = small.pop().expect("at least two entries");
        let mut merged_amount = target.amount;
        let ids: Vec<Uuid> = small.iter().map(|e| e.id).collect();

        for entry in &small {
            self.adapter
                .send(
                    currency,
                    &entry.source_address,
                    &target.source_address,
                    entry.amount,
                    &entry.key_handle,
                )
                .await?;
            merged_amount += entry.amount;
        }

        let mut all_ids = ids;
        all_ids.push(target.id);
        self.repository.mark_pool_entries_used(&all_ids, op).await?;

        let merged = PoolEntry {
            id: Uuid::new_v4(),
            amount: merged_amount,
            added_at: Utc::now(),
            used: false,
            mixing_group_id: Some(Uuid::new_v4()),
            ..target
        };
        self.repository.put_pool_entry(&merged).await?;
        info!(
            "pool[{}]: consolidated {} entries into {} ({})",
            currency,
            small.len() + 1,
            merged.id,
            merged_amount
        );
        Ok(Some(merged.id))
    }

    /// Execute an optimizer-produced rebalancing plan: move liquidity
    /// between pool tiers.
    pub async fn execute_rebalancing(
        &self,
        plan: &RebalancePlan,
        op: &ScheduledOperation,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        for mv in &plan.moves {
            let mut candidates: Vec<PoolEntry> = self
                .repository
                .pool_entries(plan.currency)
                .await?
                .into_iter()
                .filter(|e| !e.used && e.expires_at > now && e.pool_type == mv.from_type)
                .collect();
            candidates.sort_by(|a, b| a.added_at.cmp(&b.added_at));

            let mut moved: Amount = 0;
            let mut consumed: Vec<Uuid> = Vec::new();
            let mut reborn: Vec<PoolEntry> = Vec::new();
            for entry in candidates {
                if moved >= mv.amount {
                    break;
                }
                moved += entry.amount;
                consumed.push(entry.id);
                reborn.push(PoolEntry {
                    id: Uuid::new_v4(),
                    pool_type: mv.to_type,
                    added_at: Utc::now(),
                    used: false,
                    ..entry
                });
            }
            if moved < mv.amount {
                warn!(
                    "pool[{}]: rebalance short: wanted {} from {:?}, moved {}",
                    plan.currency, mv.amount, mv.from_type, moved
                );
            }
            if consumed.is_empty() {
                continue;
            }
            self.repository.mark_pool_entries_used(&consumed, op).await?;
            for entry in &reborn {
                self.repository.put_pool_entry(entry).await?;
            }
        }
        Ok(())
    }

    pub async fn stats(&self, currency: Currency) -> Result<PoolStats, EngineError> {
        let entries = self.repository.pool_entries(currency).await?;
        let mut stats = PoolStats {
            total_entries: entries.len(),
            ..PoolStats::default()
        };
        for entry in entries.iter().filter(|e| !e.used) {
            stats.unused_entries += 1;
            stats.unused_amount += entry.amount;
            *stats.by_type.entry(entry.pool_type).or_insert(0) += entry.amount;
        }
        Ok(stats)
    }
}


/// Executor for consolidation operations.
pub struct ConsolidationExecutor {
    pub pool: Arc<PoolManager>,
}

#[async_trait]
impl OperationExecutor for ConsolidationExecutor {
    async fn execute(&self, op: &ScheduledOperation, cancel: &CancelToken) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let (currency, max_entries) = match (&op.payload, op.currency) {
            (OperationPayload::Consolidation { max_entries }, Some(currency)) => {
                (currency, *max_entries)
            }
            _ => return Err(EngineError::Internal("malformed consolidation payload".into())),
        };
        self.pool.consolidate(currency, max_entries, op).await?;
        Ok(())
    }
}

/// Executor for rebalancing operations.
pub struct RebalancingExecutor {
    pub pool: Arc<PoolManager>,
}

#[async_trait]
impl OperationExecutor for RebalancingExecutor {
    async fn execute(&self, op: &ScheduledOperation, cancel: &CancelToken) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match &op.payload {
            OperationPayload::Rebalancing { plan } => {
                self.pool.execute_rebalancing(plan, op).await
            }
            _ => Err(EngineError::Internal("malformed rebalancing payload".into())),
        }
    }
}
