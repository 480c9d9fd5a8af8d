//! The Oxide Tumbler mixing engine.
//!
//! Drives mix requests through their lifecycle, runs the CoinJoin and
//! ring-signature anonymity protocols, and schedules delayed, chunked output
//! transactions. Blockchain access, secret storage, and persistence are
//! injected through the contracts in [`traits`].

pub mod coinjoin;
pub mod decoy;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod memory;
pub mod plan;
pub mod pool;
pub mod registry;
pub mod ring_tx;
pub mod scheduler;
pub mod traits;
pub mod validate;

use thiserror::Error;

pub use engine::MixingEngine;
pub use events::{EngineEvent, EventBus};

use tumbler_types::currency::Currency;
use tumbler_types::ValidationError;

/// Engine-level errors, tagged by behavior: validation and business-rule
/// errors surface to the caller, double spends and proof failures are
/// terminal for the offending input, timeouts and adapter failures feed the
/// scheduler's retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Crypto(#[from] tumbler_crypto::CryptoError),

    #[error(transparent)]
    Ring(#[from] tumbler_crypto::ClsagError),

    #[error(transparent)]
    RangeProof(#[from] tumbler_crypto::RangeProofError),

    #[error("no standard denomination fits amount {amount} for {currency}")]
    DenominationNotFound { currency: Currency, amount: u64 },

    #[error("insufficient pool liquidity for {currency}: need {needed}, have {available}")]
    InsufficientLiquidity {
        currency: Currency,
        needed: u64,
        available: u64,
    },

    #[error("session is not accepting participants")]
    SessionFull,

    #[error("participant is banned")]
    ParticipantBanned,

    #[error("unknown session")]
    SessionNotFound,

    #[error("unknown mix request")]
    RequestNotFound,

    #[error("unknown participant")]
    ParticipantNotFound,

    #[error("operation not allowed in phase {0}")]
    WrongPhase(String),

    #[error("mix request in status {0} cannot be {1}")]
    WrongStatus(String, String),

    #[error("key image already used")]
    DoubleSpend,

    #[error("proof rejected: {0}")]
    ProofFailure(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("adapter failure: {0}")]
    Adapter(String),

    #[error("repository failure: {0}")]
    Repository(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the scheduler should retry the failed operation. Validation,
    /// double-spend, and proof errors never retry; liquidity shortfalls do,
    /// since pooled change lands between attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Adapter(_)
                | EngineError::Repository(_)
                | EngineError::Timeout(_)
                | EngineError::InsufficientLiquidity { .. }
        )
    }
}
