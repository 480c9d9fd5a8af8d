//! Liquidity pool entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;
use crate::currency::Currency;
use crate::{KeyHandle, MixRequestId};

/// Which pool tier an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolType {
    Standard,
    HighVolume,
    Premium,
    Express,
}

/// One parcel of pooled liquidity. References its originating mix request
/// weakly, by id; the pool owns the entry itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: Uuid,
    pub currency: Currency,
    pub amount: Amount,
    pub source_mix_request_id: MixRequestId,
    /// Address the funds sit at, with the handle that can sign spends of it.
    pub source_address: String,
    pub key_handle: KeyHandle,
    pub added_at: DateTime<Utc>,
    /// Once set, the entry can never be selected again.
    pub used: bool,
    pub priority: u8,
    pub mixing_group_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub pool_type: PoolType,
}

/// One transfer inside a rebalancing plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceMove {
    pub from_type: PoolType,
    pub to_type: PoolType,
    pub amount: Amount,
}

/// Consolidation/redistribution plan produced by the off-critical-path
/// optimizer and executed by the pool manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub currency: Currency,
    pub moves: Vec<RebalanceMove>,
}
