//! CoinJoin session entities.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::currency::Currency;
use crate::{Hash, ParticipantId, SessionId};

/// Session phase. Transitions are forward-only; a session that left a phase
/// never returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoinJoinPhase {
    Registration,
    OutputRegistration,
    Signing,
    Broadcasting,
    Completed,
    Failed,
}

impl CoinJoinPhase {
    fn ordinal(&self) -> u8 {
        match self {
            CoinJoinPhase::Registration => 0,
            CoinJoinPhase::OutputRegistration => 1,
            CoinJoinPhase::Signing => 2,
            CoinJoinPhase::Broadcasting => 3,
            CoinJoinPhase::Completed => 4,
            CoinJoinPhase::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CoinJoinPhase::Completed | CoinJoinPhase::Failed)
    }

    /// Forward-only check. `Failed` is reachable from every live phase.
    pub fn can_advance_to(&self, next: CoinJoinPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            CoinJoinPhase::Failed => true,
            _ => next.ordinal() == self.ordinal() + 1,
        }
    }
}

impl std::fmt::Display for CoinJoinPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoinJoinPhase::Registration => "registration",
            CoinJoinPhase::OutputRegistration => "output_registration",
            CoinJoinPhase::Signing => "signing",
            CoinJoinPhase::Broadcasting => "broadcasting",
            CoinJoinPhase::Completed => "completed",
            CoinJoinPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Participant status inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    Registered,
    Committed,
    Signed,
    Confirmed,
    Failed,
}

/// An input a participant brings to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInput {
    pub tx_id: Hash,
    pub output_index: u32,
    pub amount: Amount,
    /// Key that must sign for this input; ed25519 (32 bytes) or compressed
    /// secp256k1 (33 bytes) depending on the configured algorithm.
    pub public_key: Vec<u8>,
    /// Key image of the input's spend key. Registered at signing time; a
    /// collision anywhere in the registry aborts the session.
    pub key_image: [u8; 32],
}

/// A blinded output as registered by a participant: the coordinator sees the
/// commitment and its range proof, never which participant the address
/// belongs to once shuffled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedOutput {
    pub commitment: [u8; 32],
    pub range_proof: Vec<u8>,
    pub address: String,
}

/// Plain output of the final CoinJoin transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    pub address: String,
    pub amount: Amount,
    pub script: Vec<u8>,
}

/// The equal-denomination transaction a session builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTransaction {
    pub inputs: Vec<SessionInput>,
    pub outputs: Vec<SessionOutput>,
    /// Deterministic SHA-256 digest every participant signs.
    pub digest: Hash,
    /// Input signatures, keyed by participant, in input order per participant.
    pub signatures: HashMap<ParticipantId, Vec<Vec<u8>>>,
    pub tx_hash: Option<String>,
}

/// Session fee split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFees {
    pub coordinator: Amount,
    pub network: Amount,
}

impl SessionFees {
    pub fn total(&self) -> Amount {
        self.coordinator + self.network
    }
}

/// One CoinJoin participant as the coordinator tracks them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// `H(pubkey)`.
    pub id: ParticipantId,
    pub pubkey: Vec<u8>,
    pub inputs: Vec<SessionInput>,
    pub outputs: Vec<BlindedOutput>,
    /// Coordinator-assigned blinding factor for this participant's outputs.
    pub blinding_factor: [u8; 32],
    pub commitments: Vec<[u8; 32]>,
    pub proofs: Vec<Vec<u8>>,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
}

/// Coordinator-side state of one CoinJoin round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinJoinSession {
    pub id: SessionId,
    pub currency: Currency,
    pub denomination: Amount,
    pub participants: HashMap<ParticipantId, Participant>,
    pub coordinator_pubkey: Vec<u8>,
    pub phase: CoinJoinPhase,
    pub fees: SessionFees,
    pub min_participants: usize,
    pub max_participants: usize,
    pub round: u32,
    pub transaction: Option<SessionTransaction>,
    /// Wall-clock deadline of the current phase.
    pub phase_deadline: DateTime<Utc>,
    /// Last registration time, for the registration quiet-period rule.
    pub last_join_at: DateTime<Utc>,
    pub blame_list: Vec<ParticipantId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CoinJoinSession {
    /// Participants currently registered.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    /// All participants have registered their blinded outputs.
    pub fn all_committed(&self) -> bool {
        !self.participants.is_empty()
            && self
                .participants
                .values()
                .all(|p| matches!(p.status, ParticipantStatus::Committed | ParticipantStatus::Signed))
    }

    /// All participants have produced valid input signatures.
    pub fn all_signed(&self) -> bool {
        !self.participants.is_empty()
            && self.participants.values().all(|p| p.status == ParticipantStatus::Signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_forward_only() {
        use CoinJoinPhase::*;
        assert!(Registration.can_advance_to(OutputRegistration));
        assert!(OutputRegistration.can_advance_to(Signing));
        assert!(Signing.can_advance_to(Broadcasting));
        assert!(Broadcasting.can_advance_to(Completed));
        assert!(Signing.can_advance_to(Failed));
        assert!(!OutputRegistration.can_advance_to(Registration));
        assert!(!Registration.can_advance_to(Signing));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Registration));
    }
}
