//! Currency codes, money rounding and conversion between currencies.
//!
//! USD and RWF form the privileged pair: their rate comes from a live
//! provider with layered caching and a static fallback. Every other pair
//! goes through the `currencies` table, relative to the base currency.

pub mod cache;
pub mod client;
pub mod converter;
pub mod format;
pub mod provider;

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

pub use converter::{CurrencyConversion, CurrencyConverter, CurrencyRate, CurrencyTable, PgCurrencyTable};
pub use provider::ExchangeRateProvider;

pub const USD: &str = "USD";
pub const RWF: &str = "RWF";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("Amount cannot be negative")]
    NegativeAmount,

    #[error("Currency not found: {0}")]
    NotFound(String),

    #[error("Currency {0} is not active")]
    Inactive(String),

    #[error("Currency {0} has no usable exchange rate")]
    InvalidRate(String),

    #[error("Unsupported currency code: {0}")]
    UnsupportedCode(String),

    #[error("Exchange rate API key is invalid")]
    InvalidKey,

    #[error("Exchange rate API key is not configured")]
    MissingApiKey,

    #[error("Exchange rate API quota reached")]
    QuotaReached,

    #[error("Malformed exchange rate request")]
    MalformedRequest,

    #[error("Exchange rate API account is inactive")]
    InactiveAccount,

    #[error("Exchange rate API error: {0}")]
    Api(String),

    #[error("Unexpected exchange rate API response: {0}")]
    UnexpectedResponse(String),

    #[error("Exchange rate API unreachable: {0}")]
    Transport(String),

    #[error("Exchange rate unavailable and fallback is disabled: {0}")]
    FallbackDisabled(String),

    #[error("No fallback rate configured for {0} to {1}")]
    MissingFallbackRate(String, String),
}

impl CurrencyError {
    /// Errors worth another attempt against the rate API.
    pub fn is_transient(&self) -> bool {
        matches!(self, CurrencyError::Transport(_))
    }
}

/// Canonical form of a currency code. `FRW` is a local alias for `RWF`.
pub fn normalize_code(code: &str) -> String {
    let code = code.trim().to_uppercase();
    match code.as_str() {
        "FRW" => RWF.to_string(),
        _ => code,
    }
}

pub fn is_privileged_pair(from: &str, to: &str) -> bool {
    matches!((from, to), (USD, RWF) | (RWF, USD))
}

/// Rounds to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn normalizes_aliases_and_case() {
        assert_eq!(normalize_code(" frw "), "RWF");
        assert_eq!(normalize_code("usd"), "USD");
        assert_eq!(normalize_code("Eur"), "EUR");
    }

    #[test]
    fn privileged_pair_is_symmetric() {
        assert!(is_privileged_pair(USD, RWF));
        assert!(is_privileged_pair(RWF, USD));
        assert!(!is_privileged_pair(USD, "EUR"));
        assert!(!is_privileged_pair(USD, USD));
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(2.345)), dec!(2.35));
        assert_eq!(round_money(dec!(2.344)), dec!(2.34));
    }
}
