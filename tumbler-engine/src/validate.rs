//! Address validation for output and deposit addresses.

use regex::Regex;

use tumbler_types::currency::Currency;
use tumbler_types::ValidationError;

/// Compiled per-currency address patterns. Built once at engine start; a
/// currency may accept several formats (legacy and bech32, ERC-20 and
/// TRC-20).
pub struct AddressValidator {
    btc: [Regex; 2],
    eth: Regex,
    usdt_trc20: Regex,
    sol: Regex,
    ltc: [Regex; 2],
    dash: Regex,
    zec: [Regex; 3],
}

impl AddressValidator {
    pub fn new() -> Self {
        let compile = |p: &str| Regex::new(p).expect("static address pattern");
        AddressValidator {
            btc: [
                compile(r"^[13][a-km-zA-HJ-NP-Z1-9]{25,34}$"),
                compile(r"^bc1[a-z0-9]{39,59}$"),
            ],
            eth: compile(r"^0x[a-fA-F0-9]{40}$"),
            usdt_trc20: compile(r"^T[A-Za-z1-9]{33}$"),
            sol: compile(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$"),
            ltc: [
                compile(r"^[LM3][a-km-zA-HJ-NP-Z1-9]{26,33}$"),
                compile(r"^ltc1[a-z0-9]{39,59}$"),
            ],
            dash: compile(r"^X[a-km-zA-HJ-NP-Z1-9]{33}$"),
            zec: [
                compile(r"^t1[a-km-zA-HJ-NP-Z1-9]{33}$"),
                compile(r"^t3[a-km-zA-HJ-NP-Z1-9]{33}$"),
                compile(r"^zs1[a-z0-9]{75}$"),
            ],
        }
    }

    /// Whether `address` is well-formed for `currency`.
    pub fn is_valid(&self, currency: Currency, address: &str) -> bool {
        match currency {
            Currency::Btc => self.btc.iter().any(|r| r.is_match(address)),
            Currency::Eth => self.eth.is_match(address),
            // USDT circulates on both chains; accept either format.
            Currency::Usdt => self.eth.is_match(address) || self.usdt_trc20.is_match(address),
            Currency::Sol => self.sol.is_match(address),
            Currency::Ltc => self.ltc.iter().any(|r| r.is_match(address)),
            Currency::Dash => self.dash.is_match(address),
            Currency::Zec => self.zec.iter().any(|r| r.is_match(address)),
        }
    }

    /// Validate or produce the error callers surface synchronously.
    pub fn check(&self, currency: Currency, address: &str) -> Result<(), ValidationError> {
        if self.is_valid(currency, address) {
            Ok(())
        } else {
            Err(ValidationError::InvalidAddress {
                address: address.to_string(),
                currency,
            })
        }
    }
}

impl Default for AddressValidator {
    fn default() -> Self {
        AddressValidator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS_BTC: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

    #[test]
    fn test_btc_accepted_eth_rejected() {
        let v = AddressValidator::new();
        assert!(v.is_valid(Currency::Btc, GENESIS_BTC));
        assert!(!v.is_valid(Currency::Eth, GENESIS_BTC));
    }

    #[test]
    fn test_formats_per_currency() {
        let v = AddressValidator::new();
        assert!(v.is_valid(Currency::Btc, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"));
        assert!(v.is_valid(Currency::Eth, "0x742d35Cc6634C0532925a3b844Bc454e4438f44e"));
        assert!(v.is_valid(Currency::Usdt, "0x742d35Cc6634C0532925a3b844Bc454e4438f44e"));
        assert!(v.is_valid(Currency::Usdt, "TJRabPrwbZy45sbavfcjinPJC18kjpRTv8"));
        assert!(v.is_valid(Currency::Sol, "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T"));
        assert!(v.is_valid(Currency::Ltc, "LM2WMpR1Rp6j3Sa59cMXMs1SPzj9eXpGc1"));
        assert!(v.is_valid(Currency::Dash, "XpESxaUmonkq8RaLLp46Brx2K39ggQe226"));
        assert!(v.is_valid(Currency::Zec, "t1ZYJSyoXpZ74GHM8ipDA1YUpAGeWDnsRzJ"));
    }

    #[test]
    fn test_garbage_rejected_everywhere() {
        let v = AddressValidator::new();
        for currency in Currency::ALL {
            assert!(!v.is_valid(currency, ""));
            assert!(!v.is_valid(currency, "not-an-address"));
            // 'O' and 'l' are outside base58 alphabets; '!' outside all
            assert!(!v.is_valid(currency, "1A1zP1eP5QGefi2DMPTfTL5SLmv7Div!Na"));
        }
    }
}
