//! Validation errors surfaced synchronously to callers. Never retried.

use thiserror::Error;

use crate::currency::Currency;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("address {address} is not a valid {currency} address")]
    InvalidAddress { address: String, currency: Currency },

    #[error("output percentages sum to {0}, expected 100 +/- 0.01")]
    PercentageSum(f64),

    #[error("no output addresses supplied")]
    NoOutputs,

    #[error("amount {amount} below {currency} minimum {minimum}")]
    AmountBelowMinimum {
        currency: Currency,
        amount: u64,
        minimum: u64,
    },

    #[error("amount {amount} above {currency} maximum {maximum}")]
    AmountAboveMaximum {
        currency: Currency,
        amount: u64,
        maximum: u64,
    },

    #[error("delay window {requested}s exceeds maximum {maximum}s")]
    DelayOutOfRange { requested: u64, maximum: u64 },

    #[error("mixing rounds {0} outside 1..=10")]
    MixingRounds(u8),

    #[error("unsupported currency {0}")]
    UnsupportedCurrency(String),

    #[error("ring size {size} below minimum {minimum}")]
    RingTooSmall { size: usize, minimum: usize },
}
