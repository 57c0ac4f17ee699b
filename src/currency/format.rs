use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};

use crate::currency::normalize_code;

/// Currencies that are never shown or charged with minor units.
pub const NO_DECIMAL_CURRENCIES: [&str; 9] = [
    "RWF", "JPY", "KRW", "VND", "CLP", "ISK", "UGX", "KES", "TZS",
];

pub fn is_zero_decimal(code: &str) -> bool {
    NO_DECIMAL_CURRENCIES.contains(&normalize_code(code).as_str())
}

pub fn symbol_for(code: &str) -> String {
    let code = normalize_code(code);
    match code.as_str() {
        "USD" => "$".into(),
        "RWF" => "FRW".into(),
        "EUR" => "€".into(),
        "GBP" => "£".into(),
        _ => code,
    }
}

pub fn decimals_for(code: &str, amount: Decimal) -> u32 {
    if is_zero_decimal(code) {
        return 0;
    }
    let whole = amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    if (amount - whole).abs() < Decimal::new(1, 2) {
        0
    } else {
        2
    }
}

/// Symbol followed by the amount with thousands separators, e.g. `$1,234.50` or `FRW13,500`.
pub fn format_amount(amount: Decimal, code: &str) -> String {
    let decimals = decimals_for(code, amount);
    let rounded = amount.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    let text = format!("{:.*}", decimals as usize, rounded.abs());

    let (whole, fraction) = match text.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (text.as_str(), None),
    };

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    match fraction {
        Some(fraction) => format!("{sign}{}{grouped}.{fraction}", symbol_for(code)),
        None => format!("{sign}{}{grouped}", symbol_for(code)),
    }
}

/// Amount in the smallest unit a card gateway expects.
pub fn to_minor_units(amount: Decimal, code: &str) -> Option<i64> {
    let scaled = if is_zero_decimal(code) {
        amount
    } else {
        amount * Decimal::ONE_HUNDRED
    };
    scaled
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}
