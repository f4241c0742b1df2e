use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Amounts are integers in the smallest unit of the account's currency
/// (cents for USD, yen for JPY). Signed so that debits can be expressed as
/// negative deltas.
pub type Cents = i64;

/// The fixed set of currencies an account may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Cad,
    Vnd,
    Jpy,
    Aud,
}

impl Currency {
    pub const ALL: [Currency; 6] = [
        Currency::Usd,
        Currency::Eur,
        Currency::Cad,
        Currency::Vnd,
        Currency::Jpy,
        Currency::Aud,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Cad => "CAD",
            Currency::Vnd => "VND",
            Currency::Jpy => "JPY",
            Currency::Aud => "AUD",
        }
    }

    /// Number of decimal places between the display unit and the stored unit.
    pub fn minor_units(&self) -> u32 {
        match self {
            Currency::Vnd | Currency::Jpy => 0,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = UnsupportedCurrency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        Currency::ALL
            .into_iter()
            .find(|c| c.code() == code)
            .ok_or(UnsupportedCurrency(code))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported currency: {0}")]
pub struct UnsupportedCurrency(pub String);

/// Render an amount in display units, e.g. `1234` USD -> `"12.34"`,
/// `1234` JPY -> `"1234"`.
pub fn format_amount(amount: Cents, currency: Currency) -> String {
    let places = currency.minor_units();
    if places == 0 {
        return amount.to_string();
    }
    let scale = 10_i64.pow(places);
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!(
        "{}{}.{:0width$}",
        sign,
        abs / scale as u64,
        abs % scale as u64,
        width = places as usize
    )
}

/// Parse a display-unit string into the smallest unit of `currency`.
/// Extra fractional digits beyond the currency's precision are rejected
/// rather than silently truncated.
pub fn parse_amount(input: &str, currency: Currency) -> Result<Cents, ParseAmountError> {
    let input = input.trim();
    let (negative, digits) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };
    if digits.is_empty() {
        return Err(ParseAmountError::Empty);
    }

    let places = currency.minor_units() as usize;
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if fraction.len() > places {
        return Err(ParseAmountError::TooPrecise {
            currency,
            places: currency.minor_units(),
        });
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(ParseAmountError::InvalidFormat(input.to_string()));
    }

    let scale = 10_i64.pow(places as u32);
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| ParseAmountError::InvalidFormat(input.to_string()))?
    };
    let fraction: i64 = if fraction.is_empty() {
        0
    } else {
        // "5" in a two-place currency means 50 minor units
        format!("{:0<places$}", fraction)
            .parse()
            .map_err(|_| ParseAmountError::InvalidFormat(input.to_string()))?
    };

    let amount = whole
        .checked_mul(scale)
        .and_then(|v| v.checked_add(fraction))
        .ok_or_else(|| ParseAmountError::Overflow(input.to_string()))?;
    Ok(if negative { -amount } else { amount })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseAmountError {
    #[error("empty amount")]
    Empty,

    #[error("invalid amount: {0}")]
    InvalidFormat(String),

    #[error("{currency} amounts take at most {places} decimal places")]
    TooPrecise { currency: Currency, places: u32 },

    #[error("amount out of range: {0}")]
    Overflow(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_parse_is_case_insensitive() {
        assert_eq!("usd".parse::<Currency>(), Ok(Currency::Usd));
        assert_eq!(" JPY ".parse::<Currency>(), Ok(Currency::Jpy));
        assert!("GBP".parse::<Currency>().is_err());
    }

    #[test]
    fn test_currency_serializes_as_code() {
        let json = serde_json::to_string(&Currency::Cad).unwrap();
        assert_eq!(json, "\"CAD\"");
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(5000, Currency::Usd), "50.00");
        assert_eq!(format_amount(1, Currency::Eur), "0.01");
        assert_eq!(format_amount(-1234, Currency::Aud), "-12.34");
        assert_eq!(format_amount(1500, Currency::Jpy), "1500");
        assert_eq!(format_amount(-7, Currency::Vnd), "-7");
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("50", Currency::Usd), Ok(5000));
        assert_eq!(parse_amount("12.5", Currency::Usd), Ok(1250));
        assert_eq!(parse_amount(".07", Currency::Eur), Ok(7));
        assert_eq!(parse_amount("-3.10", Currency::Cad), Ok(-310));
        assert_eq!(parse_amount("1500", Currency::Jpy), Ok(1500));
    }

    #[test]
    fn test_parse_amount_rejects_bad_input() {
        assert_eq!(parse_amount("", Currency::Usd), Err(ParseAmountError::Empty));
        assert!(matches!(
            parse_amount("1.234", Currency::Usd),
            Err(ParseAmountError::TooPrecise { .. })
        ));
        assert!(matches!(
            parse_amount("1.5", Currency::Jpy),
            Err(ParseAmountError::TooPrecise { .. })
        ));
        assert!(parse_amount("12a", Currency::Usd).is_err());
        assert!(parse_amount("1.2.3", Currency::Usd).is_err());
    }
}
