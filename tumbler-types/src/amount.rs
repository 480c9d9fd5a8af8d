//! Amount arithmetic in integer base units.

use crate::currency::Currency;

/// Amounts are integer base units of their currency (satoshi-style).
/// Every balance check in the engine is exact integer arithmetic.
pub type Amount = u64;

/// Apply a percentage (e.g. `1.5` for 1.5%) to an amount, rounding to the
/// nearest base unit.
pub fn percentage_of(amount: Amount, percentage: f64) -> Amount {
    ((amount as f64) * percentage / 100.0).round() as Amount
}

/// Format an amount as a decimal coin value, trimming trailing zeros.
pub fn format_amount(currency: Currency, amount: Amount) -> String {
    let base = currency.base_units_per_coin();
    let whole = amount / base;
    let frac = amount % base;
    if frac == 0 {
        return format!("{} {}", whole, currency.ticker());
    }
    let width = (base as f64).log10().round() as usize;
    let frac_str = format!("{:0width$}", frac, width = width);
    let frac_str = frac_str.trim_end_matches('0');
    format!("{}.{} {}", whole, frac_str, currency.ticker())
}

/// Parse a decimal coin value ("0.723") into base units. Fails on negative
/// values, malformed input, or more fractional digits than the currency
/// carries.
pub fn parse_amount(currency: Currency, s: &str) -> Option<Amount> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') {
        return None;
    }
    let base = currency.base_units_per_coin();
    let width = (base as f64).log10().round() as usize;
    let mut parts = s.splitn(2, '.');
    let whole: u64 = parts.next()?.parse().ok()?;
    let frac_part = parts.next().unwrap_or("");
    if frac_part.len() > width || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut frac: u64 = 0;
    if !frac_part.is_empty() {
        frac = frac_part.parse().ok()?;
        frac *= 10u64.pow((width - frac_part.len()) as u32);
    }
    whole.checked_mul(base)?.checked_add(frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_of() {
        assert_eq!(percentage_of(100_000_000, 1.5), 1_500_000);
        assert_eq!(percentage_of(0, 5.0), 0);
        assert_eq!(percentage_of(1_000, 0.0), 0);
    }

    #[test]
    fn test_parse_and_format() {
        assert_eq!(parse_amount(Currency::Btc, "0.723"), Some(72_300_000));
        assert_eq!(parse_amount(Currency::Btc, "1"), Some(100_000_000));
        assert_eq!(parse_amount(Currency::Eth, "0.01"), Some(10_000_000));
        assert_eq!(parse_amount(Currency::Btc, "-1"), None);
        assert_eq!(parse_amount(Currency::Btc, "0.123456789"), None); // 9 digits > 8
        assert_eq!(format_amount(Currency::Btc, 72_300_000), "0.723 BTC");
        assert_eq!(format_amount(Currency::Btc, 100_000_000), "1 BTC");
    }
}
