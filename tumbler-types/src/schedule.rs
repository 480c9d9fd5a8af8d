//! Scheduled operation entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::currency::Currency;
use crate::pool::RebalancePlan;
use crate::{MixRequestId, OperationId, SessionId};

/// The kinds of deferred work the scheduler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Distribution,
    Consolidation,
    Coinjoin,
    Rebalancing,
    Cleanup,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Distribution => "distribution",
            OperationKind::Consolidation => "consolidation",
            OperationKind::Coinjoin => "coinjoin",
            OperationKind::Rebalancing => "rebalancing",
            OperationKind::Cleanup => "cleanup",
        };
        write!(f, "{}", s)
    }
}

/// Operation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Scheduled,
    Queued,
    Executing,
    Completed,
    RetryPending,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// States from which a caller may cancel. Executing operations are
    /// refused; they finish their current atomic step first.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OperationStatus::Scheduled | OperationStatus::Queued | OperationStatus::RetryPending
        )
    }
}

/// Per-kind payload. Phases carry typed data; an unknown kind is a type
/// error, not a runtime branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationPayload {
    /// Dispatch one chunked payout.
    Distribution { output_tx_id: Uuid },
    /// Merge small unused pool entries.
    Consolidation { max_entries: usize },
    /// Drive one CoinJoin session tick.
    Coinjoin { session_id: SessionId },
    /// Apply an optimizer-produced plan.
    Rebalancing { plan: RebalancePlan },
    /// Periodic housekeeping sweep.
    Cleanup,
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Distribution { .. } => OperationKind::Distribution,
            OperationPayload::Consolidation { .. } => OperationKind::Consolidation,
            OperationPayload::Coinjoin { .. } => OperationKind::Coinjoin,
            OperationPayload::Rebalancing { .. } => OperationKind::Rebalancing,
            OperationPayload::Cleanup => OperationKind::Cleanup,
        }
    }
}

/// A unit of deferred work with retry bookkeeping. Priority 1 is highest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub mix_request_id: Option<MixRequestId>,
    pub currency: Option<Currency>,
    pub scheduled_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub priority: u8,
    pub payload: OperationPayload,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ScheduledOperation {
    pub fn new(
        payload: OperationPayload,
        currency: Option<Currency>,
        mix_request_id: Option<MixRequestId>,
        scheduled_at: DateTime<Utc>,
        priority: u8,
    ) -> Self {
        ScheduledOperation {
            id: OperationId::generate(),
            kind: payload.kind(),
            mix_request_id,
            currency,
            scheduled_at,
            status: OperationStatus::Scheduled,
            retry_count: 0,
            priority,
            payload,
            created_at: Utc::now(),
            last_error: None,
        }
    }
}
