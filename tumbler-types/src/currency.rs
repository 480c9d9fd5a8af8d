//! Supported currencies and their chain-specific parameters.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

/// Currencies the engine can mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    Btc,
    Eth,
    Usdt,
    Sol,
    Ltc,
    Dash,
    Zec,
}

impl Currency {
    pub const ALL: [Currency; 7] = [
        Currency::Btc,
        Currency::Eth,
        Currency::Usdt,
        Currency::Sol,
        Currency::Ltc,
        Currency::Dash,
        Currency::Zec,
    ];

    /// Ticker symbol.
    pub fn ticker(&self) -> &'static str {
        match self {
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
            Currency::Usdt => "USDT",
            Currency::Sol => "SOL",
            Currency::Ltc => "LTC",
            Currency::Dash => "DASH",
            Currency::Zec => "ZEC",
        }
    }

    /// Base units per whole coin. Amounts are carried as integer base units
    /// everywhere in the engine; ETH is tracked at gwei precision, which is
    /// finer than the smallest ETH denomination the engine ever produces.
    pub fn base_units_per_coin(&self) -> u64 {
        match self {
            Currency::Btc | Currency::Ltc | Currency::Dash | Currency::Zec => 100_000_000,
            Currency::Eth | Currency::Sol => 1_000_000_000,
            Currency::Usdt => 1_000_000,
        }
    }

    /// Number of on-chain confirmations before a deposit is credited.
    pub fn confirmation_threshold(&self) -> u32 {
        match self {
            Currency::Btc => 3,
            Currency::Eth => 12,
            Currency::Usdt => 12,
            Currency::Sol => 32,
            Currency::Ltc => 6,
            Currency::Dash => 6,
            Currency::Zec => 6,
        }
    }

    /// Standard denominations in base units, ascending. Shared by CoinJoin
    /// session creation and mixing-plan chunking.
    pub fn denominations(&self) -> &'static [u64] {
        match self {
            // 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1, 10 BTC
            Currency::Btc => &[
                100_000,
                500_000,
                1_000_000,
                5_000_000,
                10_000_000,
                50_000_000,
                100_000_000,
                1_000_000_000,
            ],
            // 0.01, 0.05, 0.1, 0.5, 1, 5, 10, 100 ETH (gwei)
            Currency::Eth => &[
                10_000_000,
                50_000_000,
                100_000_000,
                500_000_000,
                1_000_000_000,
                5_000_000_000,
                10_000_000_000,
                100_000_000_000,
            ],
            // 10, 50, 100, 500, 1000, 5000, 10000, 100000 USDT
            Currency::Usdt => &[
                10_000_000,
                50_000_000,
                100_000_000,
                500_000_000,
                1_000_000_000,
                5_000_000_000,
                10_000_000_000,
                100_000_000_000,
            ],
            // 0.1, 0.5, 1, 5, 10, 50, 100, 1000 SOL (lamports)
            Currency::Sol => &[
                100_000_000,
                500_000_000,
                1_000_000_000,
                5_000_000_000,
                10_000_000_000,
                50_000_000_000,
                100_000_000_000,
                1_000_000_000_000,
            ],
            // 0.01, 0.05, 0.1, 0.5, 1, 5, 10, 50 coins
            Currency::Ltc | Currency::Dash | Currency::Zec => &[
                1_000_000,
                5_000_000,
                10_000_000,
                50_000_000,
                100_000_000,
                500_000_000,
                1_000_000_000,
                5_000_000_000,
            ],
        }
    }

    /// Denominations eligible for CoinJoin sessions. The two smallest chunking
    /// denominations are excluded: rounds at those sizes cannot cover
    /// coordinator plus network fees and attract no participants.
    pub fn coinjoin_denominations(&self) -> &'static [u64] {
        &self.denominations()[2..]
    }

    /// Smallest amount an output transaction may carry.
    pub fn dust_limit(&self) -> Amount {
        match self {
            Currency::Btc | Currency::Ltc | Currency::Dash | Currency::Zec => 546,
            Currency::Eth => 1_000,
            Currency::Sol => 5_000,
            Currency::Usdt => 10_000,
        }
    }

    /// Minimum mixable amount.
    pub fn min_amount(&self) -> Amount {
        match self {
            Currency::Btc => 100_000,             // 0.001 BTC
            Currency::Eth => 10_000_000,          // 0.01 ETH
            Currency::Usdt => 10_000_000,         // 10 USDT
            Currency::Sol => 100_000_000,         // 0.1 SOL
            Currency::Ltc | Currency::Dash | Currency::Zec => 1_000_000, // 0.01 coin
        }
    }

    /// Maximum mixable amount.
    pub fn max_amount(&self) -> Amount {
        match self {
            Currency::Btc => 10_000_000_000,       // 100 BTC
            Currency::Eth => 1_000_000_000_000,    // 1000 ETH
            Currency::Usdt => 1_000_000_000_000,   // 1,000,000 USDT
            Currency::Sol => 10_000_000_000_000,   // 10,000 SOL
            Currency::Ltc | Currency::Dash | Currency::Zec => 100_000_000_000, // 1000 coins
        }
    }

    /// Parse a ticker symbol, case-insensitively.
    pub fn from_ticker(s: &str) -> Option<Currency> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Some(Currency::Btc),
            "ETH" => Some(Currency::Eth),
            "USDT" => Some(Currency::Usdt),
            "SOL" => Some(Currency::Sol),
            "LTC" => Some(Currency::Ltc),
            "DASH" => Some(Currency::Dash),
            "ZEC" => Some(Currency::Zec),
            _ => None,
        }
    }

    /// Largest standard denomination not exceeding `amount`, if any.
    pub fn largest_denomination_at_most(&self, amount: Amount) -> Option<Amount> {
        self.denominations()
            .iter()
            .rev()
            .copied()
            .find(|d| *d <= amount)
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ticker())
    }
}
