//! Mix request entities and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::{percentage_of, Amount};
use crate::currency::Currency;
use crate::{KeyHandle, MixRequestId, SessionId};

/// How wide an anonymity set the client asked for. Drives ring size and the
/// number of mixing rounds the plan generator aims at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnonymityLevel {
    Low,
    Medium,
    High,
}

/// Lifecycle status of a mix request. Transitions are monotone; the only
/// back-edges are per-output retries inside `Sending`, which never revert the
/// aggregate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixStatus {
    PendingDeposit,
    DepositReceived,
    Processing,
    Mixing,
    Sending,
    Completed,
    Failed,
    Expired,
}

impl MixStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MixStatus::Completed | MixStatus::Failed | MixStatus::Expired)
    }

    fn ordinal(&self) -> u8 {
        match self {
            MixStatus::PendingDeposit => 0,
            MixStatus::DepositReceived => 1,
            MixStatus::Processing => 2,
            MixStatus::Mixing => 3,
            MixStatus::Sending => 4,
            MixStatus::Completed => 5,
            MixStatus::Failed => 6,
            MixStatus::Expired => 7,
        }
    }

    /// Whether moving to `next` is a legal transition. Terminal states never
    /// revive; active states may always fail or expire.
    pub fn can_transition_to(&self, next: MixStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            MixStatus::Failed | MixStatus::Expired => true,
            _ => next.ordinal() == self.ordinal() + 1,
        }
    }
}

impl std::fmt::Display for MixStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MixStatus::PendingDeposit => "pending_deposit",
            MixStatus::DepositReceived => "deposit_received",
            MixStatus::Processing => "processing",
            MixStatus::Mixing => "mixing",
            MixStatus::Sending => "sending",
            MixStatus::Completed => "completed",
            MixStatus::Failed => "failed",
            MixStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// One requested payout: address plus its share of the mixed amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub address: String,
    pub percentage: f64,
}

/// Tolerance on the output percentage sum, in percentage points.
pub const PERCENTAGE_SUM_TOLERANCE: f64 = 0.01;

/// Check that output percentages sum to 100 within tolerance. The epsilon
/// keeps a sum of exactly 100.01 on the accepted side of the boundary.
pub fn percentages_sum_ok(outputs: &[OutputSpec]) -> bool {
    let sum: f64 = outputs.iter().map(|o| o.percentage).sum();
    (sum - 100.0).abs() <= PERCENTAGE_SUM_TOLERANCE + 1e-9
}

/// A client's mixing request, the root entity of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixRequest {
    pub id: MixRequestId,
    pub currency: Currency,
    /// Net amount to be mixed and distributed, in base units.
    pub input_amount: Amount,
    pub output_addresses: Vec<OutputSpec>,
    /// Upper bound on the per-chunk delay, in seconds.
    pub delay_window_secs: u64,
    pub anonymity_level: AnonymityLevel,
    /// Remix passes through the pool, 1..=10.
    pub mixing_rounds: u8,
    /// Service fee in percent of `input_amount`.
    pub fee_percentage: f64,
    pub session_id: SessionId,
    pub deposit_address: String,
    pub status: MixStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MixRequest {
    /// Fee owed on this request.
    pub fn fee_amount(&self) -> Amount {
        percentage_of(self.input_amount, self.fee_percentage)
    }

    /// Gross amount the deposit address must receive: input plus fee. The
    /// plan distributes exactly `input_amount`; the engine keeps the rest.
    pub fn total_amount(&self) -> Amount {
        self.input_amount + self.fee_amount()
    }
}

/// One-time deposit address, bound 1:1 to a mix request. Carries a key handle
/// only -- raw key material stays in the secret store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositAddress {
    pub address: String,
    pub key_handle: KeyHandle,
    pub currency: Currency,
    pub mix_request_id: MixRequestId,
    /// Set once at least one on-chain deposit was observed.
    pub used: bool,
    pub expires_at: DateTime<Utc>,
}

/// Status of a single scheduled payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTxStatus {
    Pending,
    Scheduled,
    Broadcasting,
    Sent,
    Confirmed,
    Failed,
    Cancelled,
}

impl OutputTxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutputTxStatus::Confirmed | OutputTxStatus::Failed | OutputTxStatus::Cancelled
        )
    }
}

/// One delayed, chunked payout owned by a mix request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTransaction {
    pub id: Uuid,
    pub mix_request_id: MixRequestId,
    pub amount: Amount,
    /// Pool source address, filled when the send is dispatched.
    pub from_address: Option<String>,
    pub to_address: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: OutputTxStatus,
    pub retry_count: u32,
    pub priority: u8,
    pub required_confirmations: u32,
    /// Monotone non-decreasing.
    pub confirmations: u32,
    pub tx_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_monotone() {
        assert!(MixStatus::PendingDeposit.can_transition_to(MixStatus::DepositReceived));
        assert!(MixStatus::DepositReceived.can_transition_to(MixStatus::Processing));
        assert!(MixStatus::Mixing.can_transition_to(MixStatus::Failed));
        assert!(MixStatus::Sending.can_transition_to(MixStatus::Expired));
        // No skips, no reversals, no terminal revival
        assert!(!MixStatus::PendingDeposit.can_transition_to(MixStatus::Processing));
        assert!(!MixStatus::Processing.can_transition_to(MixStatus::DepositReceived));
        assert!(!MixStatus::Completed.can_transition_to(MixStatus::Mixing));
        assert!(!MixStatus::Failed.can_transition_to(MixStatus::PendingDeposit));
    }

    #[test]
    fn test_percentage_sum_tolerance() {
        let make = |a: f64, b: f64| {
            vec![
                OutputSpec { address: "x".into(), percentage: a },
                OutputSpec { address: "y".into(), percentage: b },
            ]
        };
        assert!(percentages_sum_ok(&make(60.0, 40.0)));
        assert!(percentages_sum_ok(&make(60.0, 40.01)));
        assert!(!percentages_sum_ok(&make(60.0, 40.02)));
        assert!(!percentages_sum_ok(&make(60.0, 39.98)));
    }
}
